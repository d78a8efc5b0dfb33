use crate::clade_sampler::{CladeDataLoader, CladeSampler};
use crate::phylo_tree::{EdgeLength, PhyloTree};
use crate::population::randn;
use crate::tree_prior::TreeStructuralPrior;

use candle_util::candle_aux_layers::FcConfig;
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_data_loader::{InMemoryData, MinibatchData};
use candle_util::candle_data_loader_util::index_tensor;
use candle_util::candle_decoder_expression::{Dispersion, ExpressionDecoder};
use candle_util::candle_inference::{TrainConfig, TrainingDiagnostics};
use candle_util::candle_model_encoder::GaussianEncoder;
use candle_util::candle_model_traits::*;
use candle_util::candle_nn::{VarBuilder, VarMap};
use candle_util::candle_vae_inference::{ReconstructionLoss, Vae, VaeForward, VaeT};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Architecture and tree handling of a [`TreeVae`]
#[derive(Clone, Debug)]
pub struct TreeVaeConfig {
    pub n_latent: usize,
    pub n_hidden: usize,
    pub n_layers: usize,
    pub dropout_rate: f32,
    pub dispersion: Dispersion,
    /// number of batches, used by `Dispersion::GeneBatch`
    pub n_batch: usize,
    /// number of labels, used by `Dispersion::GeneLabel`
    pub n_labels: usize,
    pub log_variational: bool,
    pub reconstruction_loss: ReconstructionLoss,
    pub edge_length: EdgeLength,
    /// collapse the tree into clades at this depth before training
    pub clade_depth: Option<usize>,
    /// tree-wide minibatches drawn per epoch
    pub steps_per_epoch: usize,
    pub seed: u64,
}

impl Default for TreeVaeConfig {
    fn default() -> Self {
        Self {
            n_latent: 10,
            n_hidden: 128,
            n_layers: 1,
            dropout_rate: 0.1,
            dispersion: Dispersion::Gene,
            n_batch: 0,
            n_labels: 0,
            log_variational: true,
            reconstruction_loss: ReconstructionLoss::Zinb,
            edge_length: EdgeLength::Unit,
            clade_depth: None,
            steps_per_epoch: 1,
            seed: 0,
        }
    }
}

/// A count VAE whose latent codes are tied by the lineage tree
pub struct TreeVae {
    config: TreeVaeConfig,
    variable_map: VarMap,
    encoder: GaussianEncoder,
    decoder: ExpressionDecoder,
    prior: TreeStructuralPrior,
    device: Device,
}

impl TreeVae {
    pub fn new(
        n_features: usize,
        tree: PhyloTree,
        config: TreeVaeConfig,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let tree = match config.clade_depth {
            Some(depth) => {
                let collapsed = tree.collapse_at_depth(depth)?;
                info!(
                    "collapsed {} leaves into {} clades at depth {}",
                    tree.leaves().len(),
                    collapsed.leaves().len(),
                    depth
                );
                collapsed
            }
            None => tree,
        };

        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, device);

        let fc = FcConfig {
            dropout_rate: config.dropout_rate,
            ..FcConfig::default()
        };
        let layers = vec![config.n_hidden; config.n_layers.max(1)];

        let encoder = GaussianEncoder::new(
            n_features,
            config.n_latent,
            &layers,
            &fc,
            config.log_variational,
            vs.clone(),
        )?;

        let n_categories = match config.dispersion {
            Dispersion::Gene => 0,
            Dispersion::GeneBatch => config.n_batch,
            Dispersion::GeneLabel => config.n_labels,
        };
        let decoder = ExpressionDecoder::new(
            n_features,
            config.n_latent,
            &layers,
            &fc,
            config.dispersion,
            n_categories,
            vs,
        )?;

        let prior = TreeStructuralPrior::new(tree, config.n_latent, config.edge_length)?;

        Ok(Self {
            config,
            variable_map,
            encoder,
            decoder,
            prior,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &TreeVaeConfig {
        &self.config
    }

    pub fn prior(&self) -> &TreeStructuralPrior {
        &self.prior
    }

    pub fn tree(&self) -> &PhyloTree {
        self.prior.tree()
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// borrow the parts as a generic VAE
    pub fn vae(&self) -> Vae<'_, GaussianEncoder, ExpressionDecoder, TreeStructuralPrior> {
        Vae {
            encoder: &self.encoder,
            decoder: &self.decoder,
            prior: &self.prior,
            variable_map: &self.variable_map,
            reconstruction_loss: self.config.reconstruction_loss,
        }
    }

    /// Score one tree-wide minibatch; rows must follow the prior's barcodes
    pub fn forward(
        &self,
        mb: &MinibatchData,
        train: bool,
        diagnostics: Option<&mut TrainingDiagnostics>,
    ) -> candle_util::candle_core::Result<VaeForward> {
        self.vae().forward(mb, train, diagnostics)
    }

    /// Fit encoder and decoder. Each step draws one cell per leaf.
    ///
    /// * `data` - counts, one row per cell
    /// * `cell_names` - barcode of each row of `data`
    pub fn train(
        &self,
        data: &InMemoryData,
        cell_names: &[Box<str>],
        train_config: &TrainConfig,
        diagnostics: &mut TrainingDiagnostics,
    ) -> anyhow::Result<Vec<f32>> {
        if cell_names.len() != data.num_rows() {
            return Err(anyhow::anyhow!(
                "{} cell names for {} rows",
                cell_names.len(),
                data.num_rows()
            ));
        }
        let sampler = CladeSampler::new(
            self.tree(),
            self.prior.barcodes(),
            cell_names,
            self.config.seed,
        )?;
        let mut loader = CladeDataLoader::new(data, sampler, self.config.steps_per_epoch);

        info!(
            "training over {} leaves, {} step(s) per epoch",
            self.prior.num_leaves(),
            self.config.steps_per_epoch
        );
        self.vae()
            .train_encoder_decoder(&mut loader, train_config, diagnostics)
    }

    /// Posterior mean of every leaf: the average of `qz_m` over the
    /// cells it owns, in the prior's barcode order (leaves x k)
    pub fn leaf_evidence(
        &self,
        data: &InMemoryData,
        cell_names: &[Box<str>],
    ) -> anyhow::Result<Tensor> {
        let sampler = CladeSampler::new(self.tree(), self.prior.barcodes(), cell_names, 0)?;
        let (qz_m, _) = self.latent_posterior(&data.counts().to_device(&self.device)?)?;

        let mut rows = Vec::with_capacity(sampler.num_leaves());
        for group in sampler.groups() {
            let idx = index_tensor(group, &self.device)?;
            rows.push(qz_m.index_select(&idx, 0)?.mean(0)?);
        }
        Ok(Tensor::stack(&rows, 0)?)
    }

    /// Predictive `(mu, nu)` at `query` given leaf evidence (leaves x k)
    pub fn posterior_predictive_density(
        &self,
        query: &str,
        evidence: Option<&Tensor>,
    ) -> anyhow::Result<(Tensor, f64)> {
        Ok(self.prior.posterior_predictive_density(query, evidence)?)
    }

    /// Decode `n_samples` draws from the predictive latent distribution
    /// of an unobserved node at a fixed library size. Draws are seeded
    /// by `seed` of the model configuration.
    pub fn ancestral_expression(
        &self,
        query: &str,
        evidence: Option<&Tensor>,
        library_size: f64,
        n_samples: usize,
        covar: &Covariates,
    ) -> anyhow::Result<ExpressionParams> {
        if !(library_size > 0.) {
            return Err(anyhow::anyhow!("library size must be positive"));
        }
        let (mu, nu) = self.posterior_predictive_density(query, evidence)?;
        let n = n_samples.max(1);
        let k = mu.dim(0)?;

        let mu_nk = mu
            .to_device(&self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .broadcast_as((n, k))?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let eps = randn(&mut rng, (n, k), DType::F32, &self.device)?;
        let z_nk = (mu_nk + eps.affine(nu.sqrt(), 0.)?)?;
        let library = Tensor::full(library_size.ln() as f32, (n, 1), &self.device)?;

        Ok(self.decode(&z_nk, &library, covar)?)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        self.variable_map.save(path)?;
        info!("saved model parameters to {}", path);
        Ok(())
    }

    pub fn load(&mut self, path: &str) -> anyhow::Result<()> {
        self.variable_map.load(path)?;
        info!("loaded model parameters from {}", path);
        Ok(())
    }
}

impl GenerativeModelT for TreeVae {
    fn dim_obs(&self) -> usize {
        self.encoder.dim_obs()
    }

    fn dim_latent(&self) -> usize {
        self.encoder.dim_latent()
    }

    fn latent_posterior(&self, x_nd: &Tensor) -> candle_util::candle_core::Result<(Tensor, Tensor)> {
        self.vae().latent_posterior(x_nd)
    }

    fn decode(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        covar: &Covariates,
    ) -> candle_util::candle_core::Result<ExpressionParams> {
        self.vae().decode(z_nk, library_n1, covar)
    }

    fn log_likelihood(
        &self,
        x_nd: &Tensor,
        params: &ExpressionParams,
    ) -> candle_util::candle_core::Result<Tensor> {
        self.vae().log_likelihood(x_nd, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_newick;

    fn toy_counts(dev: &Device) -> anyhow::Result<Tensor> {
        Ok(Tensor::new(
            &[
                [12_f32, 0., 1., 3.],
                [10., 1., 0., 2.],
                [0., 9., 4., 0.],
                [1., 11., 3., 1.],
            ],
            dev,
        )?)
    }

    fn small_config() -> TreeVaeConfig {
        TreeVaeConfig {
            n_latent: 2,
            n_hidden: 8,
            dropout_rate: 0.,
            reconstruction_loss: ReconstructionLoss::Nb,
            steps_per_epoch: 2,
            ..TreeVaeConfig::default()
        }
    }

    #[test]
    fn forward_over_whole_tree() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let tree = parse_newick("((A,B)X,(C,D)Y)R;")?;
        let model = TreeVae::new(4, tree, small_config(), &dev)?;

        let data = InMemoryData::new(&toy_counts(&dev)?)?;
        let mb = data.take_rows(&[0, 1, 2, 3], &dev)?;
        let mut diag = TrainingDiagnostics::new(4);
        let out = model.forward(&mb, true, Some(&mut diag))?;

        assert!(out.loss.to_scalar::<f32>()?.is_finite());
        assert!(out.structural_llik.to_scalar::<f32>()?.is_finite());
        assert_eq!(diag.len(), 1);
        Ok(())
    }

    #[test]
    fn train_on_clades_then_predict_ancestors() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let tree = parse_newick("(((a,b)X,(c,d)Y)P,((e,f)Z,g)Q)R;")?;
        let config = TreeVaeConfig {
            clade_depth: Some(2),
            ..small_config()
        };
        let model = TreeVae::new(4, tree, config, &dev)?;
        assert_eq!(model.prior().num_leaves(), 4);

        let counts = Tensor::cat(&[toy_counts(&dev)?, toy_counts(&dev)?], 0)?.narrow(0, 0, 7)?;
        let data = InMemoryData::new(&counts)?;
        let cells: Vec<Box<str>> = ["a", "b", "c", "d", "e", "f", "g"]
            .iter()
            .map(|&s| s.into())
            .collect();

        let train_config = TrainConfig {
            learning_rate: 1e-2,
            num_epochs: 3,
            ..TrainConfig::default()
        };
        let mut diag = TrainingDiagnostics::new(100);
        let trace = model.train(&data, &cells, &train_config, &mut diag)?;
        assert_eq!(trace.len(), 3);
        assert_eq!(diag.len(), 6);
        assert!(trace.iter().all(|x| x.is_finite()));

        let evidence = model.leaf_evidence(&data, &cells)?;
        assert_eq!(evidence.dims(), &[4, 2]);

        let (mu, nu) = model.posterior_predictive_density("P", Some(&evidence))?;
        assert_eq!(mu.dims(), &[2]);
        assert!(nu > 0.);

        let params = model.ancestral_expression("P", Some(&evidence), 1e3, 5, &Covariates::default())?;
        assert_eq!(params.px_scale.dims(), &[5, 4]);
        let rowsum = params.px_scale.sum(1)?.to_vec1::<f32>()?;
        for s in rowsum {
            approx::assert_abs_diff_eq!(s, 1., epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn ancestral_expression_is_reproducible() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let tree = parse_newick("((A,B)X,(C,D)Y)R;")?;
        let config = TreeVaeConfig {
            seed: 11,
            ..small_config()
        };
        let model = TreeVae::new(4, tree, config, &dev)?;
        let data = InMemoryData::new(&toy_counts(&dev)?)?;
        let cells: Vec<Box<str>> = ["A", "B", "C", "D"].iter().map(|&s| s.into()).collect();
        let evidence = model.leaf_evidence(&data, &cells)?;

        let covar = Covariates::default();
        let first = model.ancestral_expression("X", Some(&evidence), 1e3, 6, &covar)?;
        let second = model.ancestral_expression("X", Some(&evidence), 1e3, 6, &covar)?;
        let reused = model.ancestral_expression("X", None, 1e3, 6, &covar)?;

        let first = first.px_scale.to_vec2::<f32>()?;
        assert_eq!(first, second.px_scale.to_vec2::<f32>()?);
        assert_eq!(first, reused.px_scale.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn checkpoint_roundtrip() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let tree = parse_newick("(A,B)R;")?;
        let model = TreeVae::new(4, tree.clone(), small_config(), &dev)?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        let path = path.to_str().ok_or(anyhow::anyhow!("path"))?;
        model.save(path)?;

        let mut other = TreeVae::new(4, tree, small_config(), &dev)?;
        other.load(path)?;

        let x = toy_counts(&dev)?;
        let (m1, _) = model.latent_posterior(&x)?;
        let (m2, _) = other.latent_posterior(&x)?;
        let diff = (m1 - m2)?.abs()?.max_all()?.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(diff, 0., epsilon = 1e-6);
        Ok(())
    }
}
