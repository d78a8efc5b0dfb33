use crate::lentil_common::*;

use candle_util::candle_core::{Device, Tensor};
use candle_util::candle_inference::{TrainConfig, TrainingDiagnostics};
use lentil::population::latent_means;
use lentil::tree_vae::{TreeVae, TreeVaeConfig};
use matrix_util::common_io::{mkdir, write_types};
use matrix_util::traits::IoOps;

#[derive(Args, Debug)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.safetensors\n\
		     - {out}.loss.tsv\n\
		     - {out}.latent.tsv\n\
		     - {out}.leaf_latent.tsv\n"
    )]
    pub out: Box<str>,

    #[arg(long, short = 'i', default_value_t = 400, help = "Number of training epochs")]
    pub epochs: usize,

    #[arg(
        long,
        default_value_t = 1,
        help = "Tree-wide minibatches per epoch",
        long_help = "Each step draws one cell for every leaf (or clade)\n\
		     and scores them jointly under the tree prior."
    )]
    pub steps_per_epoch: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 128, help = "Cells per forward pass when encoding")]
    pub minibatch_size: usize,

    #[arg(long, default_value_t = false, help = "Show progress bar")]
    pub show_progress: bool,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    pub verbose: bool,
}

pub fn fit_tree_vae(args: &FitArgs) -> anyhow::Result<()> {
    enable_logging(args.verbose);

    let input = read_count_input(&args.input)?;
    let device = args.model.device.to_device(args.model.device_no)?;
    let config = TreeVaeConfig {
        steps_per_epoch: args.steps_per_epoch,
        ..args.model.tree_vae_config(&input)
    };
    let model = build_tree_vae(&input, &args.input.tree, config, &device)?;

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: args.show_progress,
    };

    let mut diagnostics = TrainingDiagnostics::default();
    let losses = model.train(&input.data, &input.cells, &train_config, &mut diagnostics)?;
    if let Some(last) = diagnostics.last() {
        info!(
            "last step: reconstruction {}, tree log-likelihood per cell {}",
            last.reconstruction_loss, last.structural_llik_per_cell
        );
    }

    mkdir(&args.out)?;
    model.save(&format!("{}.safetensors", args.out))?;
    write_types(&losses, &format!("{}.loss.tsv", args.out))?;

    write_cell_latent(&model, &input, args.minibatch_size, &device, &args.out)?;

    let leaf_latent = model.leaf_evidence(&input.data, &input.cells)?;
    leaf_latent.write_file_delim_named(
        &format!("{}.leaf_latent.tsv", args.out),
        "\t",
        Some(model.prior().barcodes()),
        Some(&latent_column_names(model.config().n_latent)),
    )?;

    Ok(())
}

fn write_cell_latent(
    model: &TreeVae,
    input: &CountInput,
    batch_size: usize,
    device: &Device,
    out: &str,
) -> anyhow::Result<()> {
    let rows: Vec<usize> = (0..input.data.num_rows()).collect();
    let qz_m = latent_means(model, &input.data, &rows, batch_size, device)?;
    let (n, k) = qz_m.shape();
    let values: Vec<f32> = (0..n)
        .flat_map(|i| (0..k).map(move |j| (i, j)))
        .map(|ij| qz_m[ij] as f32)
        .collect();
    Tensor::from_vec(values, (n, k), &Device::Cpu)?.write_file_delim_named(
        &format!("{}.latent.tsv", out),
        "\t",
        Some(&input.cells),
        Some(&latent_column_names(k)),
    )
}
