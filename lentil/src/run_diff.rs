use crate::lentil_common::*;

use lentil::differential::{differential_expression, DeConfig, DeMode, ExpressionSampler};
use lentil::population::PopulationConfig;
use matrix_util::common_io::{mkdir, read_lines};
use matrix_util::utils::partition_by_membership;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum DeModeArg {
    Change,
    Vanilla,
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
pub enum SamplerArg {
    Importance,
    PlugIn,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, short = 'm', required = true, help = "Fitted model parameters")]
    pub model_file: Box<str>,

    #[arg(
        long,
        short = 'g',
        required = true,
        help = "Group membership file",
        long_help = "Group (e.g. cell type) of each cell, one per line,\n\
		     in the row order of the counts."
    )]
    pub groups: Box<str>,

    #[arg(
        long,
        help = "First group",
        long_help = "First group of the comparison.\n\
		     Without it every group is compared against the rest."
    )]
    pub group1: Option<Box<str>>,

    #[arg(long, help = "Second group (defaults to all other cells)")]
    pub group2: Option<Box<str>>,

    #[arg(
        long,
        value_enum,
        default_value = "change",
        help = "Hypothesis",
        long_help = "change: P(|log2 fold change| >= delta).\n\
		     vanilla: P(h1 > h2)."
    )]
    pub mode: DeModeArg,

    #[arg(
        long,
        value_enum,
        default_value = "importance",
        help = "Expression sampler",
        long_help = "importance: importance-weighted population samples.\n\
		     plug-in: one posterior draw per cell."
    )]
    pub sampler: SamplerArg,

    #[arg(long, default_value_t = 0.25, help = "Minimum log2 fold change of interest")]
    pub delta: f64,

    #[arg(long, default_value_t = 0.0, help = "Pseudocount added before taking log2")]
    pub pseudocounts: f64,

    #[arg(long, default_value_t = 0.05, help = "Target false discovery rate")]
    pub fdr_target: f64,

    #[arg(long, default_value_t = 10000, help = "Random cross-group pairs")]
    pub m_permutation: usize,

    #[arg(long, default_value_t = 5000, help = "Plug-in profiles per group")]
    pub n_samples: usize,

    #[arg(long, default_value_t = 25, help = "Importance samples per cell")]
    pub n_samples_per_cell: usize,

    #[arg(long, help = "Total importance-weighted profiles per group")]
    pub n_samples_overall: Option<usize>,

    #[arg(long, default_value_t = 5000, help = "Monte Carlo draws per cell for log p(x)")]
    pub n_mc_samples: usize,

    #[arg(long, default_value_t = 500, help = "Cells per importance-sampling chunk")]
    pub n_cells_per_chunk: usize,

    #[arg(long, help = "Maximum number of chunks per group")]
    pub max_chunks: Option<usize>,

    #[arg(long, default_value_t = 64, help = "Cells per forward pass")]
    pub minibatch_size: usize,

    #[arg(long, default_value_t = false, help = "Keep latent-space outliers")]
    pub keep_outliers: bool,

    #[arg(
        long,
        help = "Batch to condition on",
        long_help = "Only use cells of this batch and decode them as members of it."
    )]
    pub transform_batch: Option<Box<str>>,

    #[arg(long, default_value_t = false, help = "Process chunks in parallel")]
    pub parallel: bool,

    #[arg(long, default_value_t = false, help = "Show progress bar")]
    pub show_progress: bool,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.{group1}_vs_{group2}.de.tsv\n"
    )]
    pub out: Box<str>,

    #[arg(long, short, help = "Verbosity")]
    pub verbose: bool,
}

impl DiffArgs {
    fn de_config(&self, input: &CountInput) -> anyhow::Result<DeConfig> {
        let transform_batch = match self.transform_batch.as_deref() {
            Some(name) => Some(input.batch_code(name)?),
            None => None,
        };
        Ok(DeConfig {
            mode: match self.mode {
                DeModeArg::Change => DeMode::Change,
                DeModeArg::Vanilla => DeMode::Vanilla,
            },
            sampler: match self.sampler {
                SamplerArg::Importance => ExpressionSampler::ImportanceSampling,
                SamplerArg::PlugIn => ExpressionSampler::PlugIn,
            },
            delta: self.delta,
            pseudocounts: self.pseudocounts,
            fdr_target: self.fdr_target,
            m_permutation: self.m_permutation,
            n_samples: self.n_samples,
            seed: self.model.seed,
            population: PopulationConfig {
                n_samples: self.n_samples_per_cell,
                n_samples_overall: self.n_samples_overall,
                batch_size: self.minibatch_size,
                filter_cells: !self.keep_outliers,
                transform_batch,
                n_mc_samples: self.n_mc_samples,
                n_cells_per_chunk: self.n_cells_per_chunk,
                max_chunks: self.max_chunks,
                seed: self.model.seed,
                parallel_chunks: self.parallel,
                show_progress: self.show_progress,
                ..PopulationConfig::default()
            },
        })
    }
}

pub fn run_differential_expression(args: &DiffArgs) -> anyhow::Result<()> {
    enable_logging(args.verbose);

    let input = read_count_input(&args.input)?;
    let device = args.model.device.to_device(args.model.device_no)?;
    let mut model = build_tree_vae(&input, &args.input.tree, args.model.tree_vae_config(&input), &device)?;
    model.load(&args.model_file)?;

    let membership = read_lines(&args.groups)?;
    if membership.len() != input.data.num_rows() {
        return Err(anyhow::anyhow!(
            "{} group labels for {} cells",
            membership.len(),
            input.data.num_rows()
        ));
    }
    let groups = partition_by_membership(&membership, None, &mut rand::rng());

    let mut comparisons: Vec<(Box<str>, Box<str>)> = match args.group1.as_ref() {
        Some(g1) => vec![(g1.clone(), args.group2.clone().unwrap_or_else(|| "rest".into()))],
        None => groups.keys().map(|g| (g.clone(), "rest".into())).collect(),
    };
    comparisons.sort();

    let config = args.de_config(&input)?;
    mkdir(&args.out)?;

    for (g1, g2) in comparisons {
        let idx1 = groups
            .get(&g1)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no cells in group {}", g1))?;
        let idx2: Vec<usize> = match args.group2.as_ref() {
            Some(_) => groups
                .get(&g2)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no cells in group {}", g2))?,
            None => (0..membership.len())
                .filter(|&i| membership[i] != g1)
                .collect(),
        };
        if idx2.is_empty() {
            warn!("nothing to compare {} against", g1);
            continue;
        }

        info!("{} ({} cells) vs. {} ({} cells)", g1, idx1.len(), g2, idx2.len());
        let table = differential_expression(
            &model,
            &input.data,
            &input.genes,
            &idx1,
            &idx2,
            &config,
            &device,
        )?;

        let n_de = table
            .genes
            .iter()
            .filter(|g| g.is_de_fdr.unwrap_or(false))
            .count();
        if config.mode == DeMode::Change {
            info!("{} genes pass FDR {}", n_de, config.fdr_target);
        }

        table.to_tsv(&format!("{}.{}_vs_{}.de.tsv", args.out, g1, g2))?;
    }

    Ok(())
}
