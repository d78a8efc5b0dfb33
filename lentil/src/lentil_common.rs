pub use candle_util::candle_core;
pub use clap::{Args, ValueEnum};
pub use log::{info, warn};

use candle_util::candle_core::Tensor;
use candle_util::candle_data_loader::{CategoricalCodes, InMemoryData};
use candle_util::candle_decoder_expression::Dispersion;
use candle_util::candle_vae_inference::ReconstructionLoss;
use lentil::newick::read_newick;
use lentil::phylo_tree::EdgeLength;
use lentil::tree_vae::{TreeVae, TreeVaeConfig};
use matrix_util::common_io::read_lines;
use matrix_util::traits::IoOps;
use matrix_util::utils::partition_by_membership;
use std::collections::HashMap;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<candle_core::Device> {
        Ok(match self {
            ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
            _ => candle_core::Device::Cpu,
        })
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
pub enum DispersionArg {
    Gene,
    GeneBatch,
    GeneLabel,
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum LikelihoodArg {
    Zinb,
    Nb,
    Poisson,
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum EdgeLengthArg {
    Unit,
    Branch,
}

pub fn enable_logging(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    #[arg(
        long,
        short = 'x',
        required = true,
        help = "Count matrix (cells x genes)",
        long_help = "Count matrix with one row per cell and one column per gene.\n\
		     The first line holds gene names.\n\
		     Tab-separated unless the file ends with `.csv` or `.csv.gz`."
    )]
    pub counts: Box<str>,

    #[arg(
        long,
        short = 'c',
        help = "Cell barcode file",
        long_help = "Cell barcodes, one per line, in the row order of the counts.\n\
		     Barcodes are matched against the leaf names of the tree.\n\
		     Defaults to `cell_{i}`."
    )]
    pub cells: Option<Box<str>>,

    #[arg(
        long,
        short = 'b',
        help = "Batch membership file",
        long_help = "Batch name of each cell, one per line, in the row order of the counts.\n\
		     Needed by gene-batch dispersion and --transform-batch."
    )]
    pub batch: Option<Box<str>>,

    #[arg(
        long,
        short = 't',
        required = true,
        help = "Lineage tree (Newick)",
        long_help = "Lineage tree in Newick format.\n\
		     Leaf names are cell barcodes unless --clade-depth collapses\n\
		     the tree into clades."
    )]
    pub tree: Box<str>,

    #[arg(
        long,
        short = 'l',
        help = "Leaf membership file",
        long_help = "Tree leaf (e.g. clone) of each cell, one per line, in the row\n\
		     order of the counts. Without it every leaf is a single cell\n\
		     whose barcode is the leaf name."
    )]
    pub leaf_membership: Option<Box<str>>,
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long, default_value_t = 10, help = "Latent dimension")]
    pub n_latent: usize,

    #[arg(long, default_value_t = 128, help = "Hidden units per layer")]
    pub n_hidden: usize,

    #[arg(long, default_value_t = 1, help = "Number of hidden layers")]
    pub n_layers: usize,

    #[arg(long, default_value_t = 0.1, help = "Dropout rate")]
    pub dropout_rate: f32,

    #[arg(
        long,
        value_enum,
        default_value = "gene",
        help = "Dispersion sharing",
        long_help = "Where the inverse dispersion is shared.\n\
		     Options: gene, gene-batch, gene-label."
    )]
    pub dispersion: DispersionArg,

    #[arg(
        long,
        value_enum,
        default_value = "zinb",
        help = "Count likelihood",
        long_help = "Reconstruction likelihood.\n\
		     Options: zinb, nb, poisson."
    )]
    pub likelihood: LikelihoodArg,

    #[arg(
        long,
        value_enum,
        default_value = "unit",
        help = "Edge length",
        long_help = "Variance contributed by each tree edge.\n\
		     unit: every edge adds one; branch: Newick branch lengths."
    )]
    pub edge_length: EdgeLengthArg,

    #[arg(
        long,
        help = "Collapse the tree at this depth",
        long_help = "Collapse the tree into clades at this depth.\n\
		     Each clade becomes a leaf owning the cells below it,\n\
		     and training draws one cell per clade."
    )]
    pub clade_depth: Option<usize>,

    #[arg(long, default_value_t = 0, help = "Random seed")]
    pub seed: u64,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda or metal")]
    pub device_no: usize,
}

impl ModelArgs {
    pub fn tree_vae_config(&self, input: &CountInput) -> TreeVaeConfig {
        TreeVaeConfig {
            n_latent: self.n_latent,
            n_hidden: self.n_hidden,
            n_layers: self.n_layers,
            dropout_rate: self.dropout_rate,
            dispersion: match self.dispersion {
                DispersionArg::Gene => Dispersion::Gene,
                DispersionArg::GeneBatch => Dispersion::GeneBatch,
                DispersionArg::GeneLabel => Dispersion::GeneLabel,
            },
            n_batch: input.batch_names.len(),
            n_labels: 0,
            log_variational: true,
            reconstruction_loss: match self.likelihood {
                LikelihoodArg::Zinb => ReconstructionLoss::Zinb,
                LikelihoodArg::Nb => ReconstructionLoss::Nb,
                LikelihoodArg::Poisson => ReconstructionLoss::Poisson,
            },
            edge_length: match self.edge_length {
                EdgeLengthArg::Unit => EdgeLength::Unit,
                EdgeLengthArg::Branch => EdgeLength::Branch,
            },
            clade_depth: self.clade_depth,
            steps_per_epoch: 1,
            seed: self.seed,
        }
    }
}

pub struct CountInput {
    pub data: InMemoryData,
    pub cells: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
    /// batch names in code order
    pub batch_names: Vec<Box<str>>,
    /// tree leaf of each cell
    pub leaf_of_cell: Option<Vec<Box<str>>>,
}

impl CountInput {
    pub fn batch_code(&self, name: &str) -> anyhow::Result<usize> {
        self.batch_names
            .iter()
            .position(|b| b.as_ref() == name)
            .ok_or_else(|| anyhow::anyhow!("unknown batch {}", name))
    }
}

/// Codes in order of first appearance
pub fn encode_categories(names: &[Box<str>]) -> (Vec<usize>, Vec<Box<str>>) {
    let mut levels: Vec<Box<str>> = vec![];
    let mut index: HashMap<Box<str>, usize> = HashMap::new();
    let codes = names
        .iter()
        .map(|x| {
            *index.entry(x.clone()).or_insert_with(|| {
                levels.push(x.clone());
                levels.len() - 1
            })
        })
        .collect();
    (codes, levels)
}

pub fn read_count_input(args: &InputArgs) -> anyhow::Result<CountInput> {
    let (counts, genes) = Tensor::from_file(&args.counts, Some(0))?;
    let (nrows, ncols) = counts.dims2()?;
    if genes.len() != ncols {
        return Err(anyhow::anyhow!(
            "{} gene names for {} columns in {}",
            genes.len(),
            ncols,
            args.counts
        ));
    }

    let cells = match args.cells.as_deref() {
        Some(file) => read_lines(file)?,
        None => (0..nrows)
            .map(|i| format!("cell_{}", i).into_boxed_str())
            .collect(),
    };
    if cells.len() != nrows {
        return Err(anyhow::anyhow!("{} barcodes for {} cells", cells.len(), nrows));
    }

    let mut data = InMemoryData::new(&counts)?;
    let mut batch_names = vec![];
    if let Some(file) = args.batch.as_deref() {
        let (codes, levels) = encode_categories(&read_lines(file)?);
        if codes.len() != nrows {
            return Err(anyhow::anyhow!("{} batch labels for {} cells", codes.len(), nrows));
        }
        info!("{} batches", levels.len());
        data = data.with_batch(CategoricalCodes::new(codes))?;
        batch_names = levels;
    }

    let leaf_of_cell = match args.leaf_membership.as_deref() {
        Some(file) => {
            let leaves = read_lines(file)?;
            if leaves.len() != nrows {
                return Err(anyhow::anyhow!("{} leaf labels for {} cells", leaves.len(), nrows));
            }
            Some(leaves)
        }
        None => None,
    };

    info!("read {} cells x {} genes from {}", nrows, ncols, args.counts);
    Ok(CountInput {
        data,
        cells,
        genes,
        batch_names,
        leaf_of_cell,
    })
}

/// Read the tree, hand cells to their leaves and build the model
pub fn build_tree_vae(
    input: &CountInput,
    tree_file: &str,
    config: TreeVaeConfig,
    device: &candle_core::Device,
) -> anyhow::Result<TreeVae> {
    let mut tree = read_newick(tree_file)?;
    info!("{} nodes, {} leaves in {}", tree.num_nodes(), tree.leaves().len(), tree_file);

    if let Some(leaf_of_cell) = input.leaf_of_cell.as_ref() {
        let groups = partition_by_membership(leaf_of_cell, None, &mut rand::rng());
        for (leaf, rows) in groups {
            let cells = rows.iter().map(|&i| input.cells[i].clone()).collect();
            tree.set_leaf_cells(&leaf, cells)?;
        }
    }

    TreeVae::new(input.data.num_features(), tree, config, device)
}

pub fn latent_column_names(k: usize) -> Vec<Box<str>> {
    (0..k).map(|j| format!("z{}", j).into_boxed_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_in_order_of_appearance() {
        let names: Vec<Box<str>> = ["b", "a", "b", "c"].iter().map(|&s| s.into()).collect();
        let (codes, levels) = encode_categories(&names);
        assert_eq!(codes, vec![0, 1, 0, 2]);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[1].as_ref(), "a");
    }
}
