mod ancestral;
mod fit_tree_vae;
mod lentil_common;
mod run_diff;

use ancestral::*;
use fit_tree_vae::*;
use run_diff::*;

use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Lineage-tree structured latent models for single-cell counts.\n\
		  Cells are tied together by a Gaussian prior that diffuses along\n\
		  a lineage tree (Newick). Count matrices are delimited text files."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a tree-prior VAE",
        long_about = "Fit encoder and decoder under the lineage-tree prior:\n\
		      (1) Read counts and hand cells to tree leaves\n\
		      (2) Train on tree-wide minibatches, one cell per leaf\n\
		      (3) Write parameters, cell latent means and leaf evidence.\n"
    )]
    Fit(FitArgs),

    #[command(
        about = "Predict unobserved tree nodes",
        long_about = "Predict latent states and expression of internal nodes\n\
		      by Gaussian message passing from the observed leaves.\n"
    )]
    Ancestral(AncestralArgs),

    #[command(
        about = "Differential expression between cell groups",
        long_about = "Bayesian differential expression:\n\
		      (1) Sample expression profiles of each group from the model\n\
		      (2) Pair profiles across groups at random\n\
		      (3) Report DE probabilities, Bayes factors and FDR flags.\n",
        visible_alias = "de"
    )]
    Diff(DiffArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Fit(args) => {
            fit_tree_vae(args)?;
        }
        Commands::Ancestral(args) => {
            predict_ancestors(args)?;
        }
        Commands::Diff(args) => {
            run_differential_expression(args)?;
        }
    }

    info!("Done");
    Ok(())
}
