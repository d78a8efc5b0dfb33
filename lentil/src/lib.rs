//! Lineage-tree structured latent models for single-cell counts.
//!
//! A VAE whose latent prior couples cells along a lineage tree through
//! Gaussian message passing, plus importance-sampled population
//! expression and Bayesian differential expression on top of any
//! [`candle_util::candle_model_traits::GenerativeModelT`].

pub mod clade_sampler;
pub mod differential;
pub mod message_passing;
pub mod newick;
pub mod outlier;
pub mod phylo_tree;
pub mod population;
pub mod tree_prior;
pub mod tree_vae;

#[cfg(test)]
mod test_fixtures;
