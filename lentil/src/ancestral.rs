use crate::lentil_common::*;

use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_data_loader_util::one_hot_codes;
use candle_util::candle_model_traits::Covariates;
use lentil::tree_vae::TreeVaeConfig;
use matrix_util::common_io::mkdir;
use matrix_util::traits::IoOps;

#[derive(Args, Debug)]
pub struct AncestralArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(
        long,
        short = 'm',
        required = true,
        help = "Fitted model parameters",
        long_help = "Model parameters saved by `lentil fit` ({out}.safetensors).\n\
		     Architecture options must match the fitted model."
    )]
    pub model_file: Box<str>,

    #[arg(
        long,
        value_delimiter(','),
        help = "Tree nodes to predict",
        long_help = "Names of the tree nodes to predict (comma-separated).\n\
		     Defaults to every internal node."
    )]
    pub nodes: Option<Vec<Box<str>>>,

    #[arg(long, default_value_t = 1e4, help = "Library size of predicted profiles")]
    pub library_size: f64,

    #[arg(long, default_value_t = 100, help = "Latent draws per node")]
    pub n_samples: usize,

    #[arg(
        long,
        help = "Batch to decode as",
        long_help = "Batch whose dispersion is used when decoding.\n\
		     Required for gene-batch dispersion; defaults to the first batch."
    )]
    pub reference_batch: Option<Box<str>>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.ancestral_latent.tsv (predictive mean and variance)\n\
		     - {out}.ancestral_expression.tsv (mean normalised expression)\n"
    )]
    pub out: Box<str>,

    #[arg(long, short, help = "Verbosity")]
    pub verbose: bool,
}

pub fn predict_ancestors(args: &AncestralArgs) -> anyhow::Result<()> {
    enable_logging(args.verbose);

    let input = read_count_input(&args.input)?;
    let device = args.model.device.to_device(args.model.device_no)?;
    let config: TreeVaeConfig = args.model.tree_vae_config(&input);
    let mut model = build_tree_vae(&input, &args.input.tree, config, &device)?;
    model.load(&args.model_file)?;

    let nodes: Vec<Box<str>> = match args.nodes.as_ref() {
        Some(nodes) => nodes.clone(),
        None => {
            let tree = model.tree();
            tree.preorder()
                .into_iter()
                .filter(|&i| !tree.is_leaf(i))
                .map(|i| tree.node(i).name.clone())
                .collect()
        }
    };
    if nodes.is_empty() {
        warn!("no tree nodes to predict");
        return Ok(());
    }

    let evidence = model.leaf_evidence(&input.data, &input.cells)?;

    let batch_onehot = if input.batch_names.is_empty() {
        None
    } else {
        let code = match args.reference_batch.as_deref() {
            Some(name) => input.batch_code(name)?,
            None => 0,
        };
        let n = args.n_samples.max(1);
        Some(one_hot_codes(&vec![code; n], input.batch_names.len(), &device)?)
    };
    let covar = Covariates {
        batch: batch_onehot.as_ref(),
        label: None,
    };

    let mut latent_rows = Vec::with_capacity(nodes.len());
    let mut expression_rows = Vec::with_capacity(nodes.len());

    for node in nodes.iter() {
        let (mu, nu) = model.posterior_predictive_density(node, Some(&evidence))?;
        let nu_k = Tensor::full(nu, 1, mu.device())?.to_dtype(mu.dtype())?;
        latent_rows.push(Tensor::cat(&[&mu, &nu_k], 0)?.to_dtype(DType::F32)?.to_device(&Device::Cpu)?);

        let params = model.ancestral_expression(
            node,
            Some(&evidence),
            args.library_size,
            args.n_samples,
            &covar,
        )?;
        expression_rows.push(params.px_scale.mean(0)?.to_device(&Device::Cpu)?);
        info!("predicted {} (variance {:.4})", node, nu);
    }

    mkdir(&args.out)?;

    let mut latent_names = latent_column_names(model.config().n_latent);
    latent_names.push("var".into());
    Tensor::stack(&latent_rows, 0)?.write_file_delim_named(
        &format!("{}.ancestral_latent.tsv", args.out),
        "\t",
        Some(&nodes),
        Some(&latent_names),
    )?;

    Tensor::stack(&expression_rows, 0)?.write_file_delim_named(
        &format!("{}.ancestral_expression.tsv", args.out),
        "\t",
        Some(&nodes),
        Some(&input.genes),
    )?;

    Ok(())
}
