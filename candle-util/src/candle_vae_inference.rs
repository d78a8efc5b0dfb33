use crate::candle_data_loader::*;
use crate::candle_inference::{ForwardRecord, TrainConfig, TrainingDiagnostics};
use crate::candle_loss_functions::*;
use crate::candle_model_traits::*;

use candle_core::{DType, Result, Tensor};
use candle_nn::AdamW;
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Observation model used to score reconstructions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconstructionLoss {
    Zinb,
    Nb,
    Poisson,
}

impl ReconstructionLoss {
    /// per-row `log p(x | params)`
    pub fn log_likelihood(&self, x_nd: &Tensor, params: &ExpressionParams) -> Result<Tensor> {
        match self {
            Self::Zinb => zinb_log_likelihood(x_nd, &params.px_rate, &params.px_r, &params.px_dropout),
            Self::Nb => nb_log_likelihood(x_nd, &params.px_rate, &params.px_r),
            Self::Poisson => poisson_log_likelihood(x_nd, &params.px_rate),
        }
    }
}

/// Everything one forward pass produces
pub struct VaeForward {
    pub latent: LatentGaussian,
    /// log library size (n x 1)
    pub library: Tensor,
    pub params: ExpressionParams,
    /// log q(z|x) per cell
    pub log_qz: Tensor,
    /// log p(x|z) per cell
    pub llik: Tensor,
    /// -log p(x|z) + log q(z|x) per cell
    pub reconst_loss: Tensor,
    /// scalar joint log-density of z under the structural prior
    pub structural_llik: Tensor,
    /// scalar objective: mean(reconst_loss) - structural_llik / n
    pub loss: Tensor,
}

/// log Σ_g x_g per row, kept as (n x 1); empty rows count as one read
pub fn log_library_size(x_nd: &Tensor) -> Result<Tensor> {
    x_nd.sum_keepdim(x_nd.rank() - 1)?.clamp(1., f64::MAX)?.log()
}

pub struct Vae<'a, Enc, Dec, Prior>
where
    Enc: GaussianEncoderT,
    Dec: ExpressionDecoderT,
    Prior: StructuralPriorT,
{
    pub encoder: &'a Enc,
    pub decoder: &'a Dec,
    pub prior: &'a Prior,
    pub variable_map: &'a candle_nn::VarMap,
    pub reconstruction_loss: ReconstructionLoss,
}

pub trait VaeT<'a, Enc, Dec, Prior>
where
    Enc: GaussianEncoderT,
    Dec: ExpressionDecoderT,
    Prior: StructuralPriorT,
{
    /// Train the VAE model
    /// * `data` - data loader should have `minibatch_data`
    /// * `train_config` - training configuration
    /// * `diagnostics` - receives one record per forward pass
    fn train_encoder_decoder<DataL>(
        &self,
        data: &mut DataL,
        train_config: &TrainConfig,
        diagnostics: &mut TrainingDiagnostics,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader;

    /// Build a VAE model
    /// * `encoder` - encoder module
    /// * `decoder` - decoder module
    /// * `prior` - structural prior over a minibatch of latent states
    fn build(
        encoder: &'a Enc,
        decoder: &'a Dec,
        prior: &'a Prior,
        variable_map: &'a candle_nn::VarMap,
        reconstruction_loss: ReconstructionLoss,
    ) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<Enc, Dec, Prior> Vae<'_, Enc, Dec, Prior>
where
    Enc: GaussianEncoderT,
    Dec: ExpressionDecoderT,
    Prior: StructuralPriorT,
{
    /// Encode, decode and score a minibatch
    ///
    /// Rows of `mb.input` must be ordered the way the prior expects.
    pub fn forward(
        &self,
        mb: &MinibatchData,
        train: bool,
        diagnostics: Option<&mut TrainingDiagnostics>,
    ) -> Result<VaeForward> {
        let x_nd = &mb.input;
        let n = x_nd.dim(0)?;
        if n == 0 {
            candle_core::bail!("empty minibatch");
        }

        let latent = self.encoder.forward_t(x_nd, train)?;
        let library = log_library_size(x_nd)?;
        let covar = Covariates {
            batch: mb.batch.as_ref(),
            label: mb.label.as_ref(),
        };
        let params = self
            .decoder
            .forward_t(&latent.sample, &library, &covar, train)?;

        let structural_llik = self.prior.structural_log_likelihood(&latent.sample)?;

        let log_qz = gaussian_log_density(&latent.sample, &latent.mean, &latent.var)?;
        let llik = self.reconstruction_loss.log_likelihood(x_nd, &params)?;
        let reconst_loss = (&log_qz - &llik)?;

        let loss = (reconst_loss.mean_all()? - (&structural_llik / n as f64)?)?;

        if let Some(diag) = diagnostics {
            let scalar = |t: &Tensor| -> Result<f32> { t.to_dtype(DType::F32)?.to_scalar::<f32>() };
            diag.record(ForwardRecord {
                reconstruction_loss: scalar(&reconst_loss.mean_all()?)?,
                structural_llik_per_cell: scalar(&structural_llik)? / n as f32,
                log_qz: scalar(&log_qz.mean_all()?)?,
            });
        }

        Ok(VaeForward {
            latent,
            library,
            params,
            log_qz,
            llik,
            reconst_loss,
            structural_llik,
            loss,
        })
    }

    /// Posterior parameters and `n_samples` draws `z (S x n x k)`
    pub fn inference(&self, x_nd: &Tensor, n_samples: usize) -> Result<(Tensor, Tensor, Tensor)> {
        let latent = self.encoder.forward_t(x_nd, false)?;
        let (n, k) = latent.mean.dims2()?;
        let shape = (n_samples.max(1), n, k);
        let mean = latent.mean.unsqueeze(0)?.broadcast_as(shape)?;
        let sd = latent.var.sqrt()?.unsqueeze(0)?.broadcast_as(shape)?;
        let eps = Tensor::randn(0., 1., shape, x_nd.device())?.to_dtype(mean.dtype())?;
        let z = (mean + (sd * eps)?)?;
        Ok((latent.mean, latent.var, z))
    }
}

impl<'a, Enc, Dec, Prior> VaeT<'a, Enc, Dec, Prior> for Vae<'a, Enc, Dec, Prior>
where
    Enc: GaussianEncoderT,
    Dec: ExpressionDecoderT,
    Prior: StructuralPriorT,
{
    fn train_encoder_decoder<DataL>(
        &self,
        data: &mut DataL,
        train_config: &TrainConfig,
        diagnostics: &mut TrainingDiagnostics,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        let mut adam = AdamW::new_lr(
            self.variable_map.all_vars(),
            train_config.learning_rate.into(),
        )?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut loss_trace = vec![];

        for epoch in 0..train_config.num_epochs {
            data.shuffle_minibatch(train_config.batch_size)?;
            let num_minibatches = data.num_minibatch();
            let mut loss_tot = 0f32;

            for b in 0..num_minibatches {
                let mb = data.minibatch_data(b, device)?;
                let out = self.forward(&mb, true, Some(&mut *diagnostics))?;
                adam.backward_step(&out.loss)?;
                loss_tot += out.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            }

            loss_trace.push(loss_tot / num_minibatches.max(1) as f32);
            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] loss: {}",
                    epoch + 1,
                    loss_trace.last().ok_or(anyhow::anyhow!("loss"))?
                );
            }
        } // each epoch

        pb.finish_and_clear();
        Ok(loss_trace)
    }

    fn build(
        encoder: &'a Enc,
        decoder: &'a Dec,
        prior: &'a Prior,
        variable_map: &'a candle_nn::VarMap,
        reconstruction_loss: ReconstructionLoss,
    ) -> anyhow::Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent() || encoder.dim_obs() != decoder.dim_obs() {
            return Err(anyhow::anyhow!(
                "encoder ({} -> {}) and decoder ({} -> {}) disagree",
                encoder.dim_obs(),
                encoder.dim_latent(),
                decoder.dim_latent(),
                decoder.dim_obs()
            ));
        }

        Ok(Self {
            encoder,
            decoder,
            prior,
            variable_map,
            reconstruction_loss,
        })
    }
}

impl<Enc, Dec, Prior> GenerativeModelT for Vae<'_, Enc, Dec, Prior>
where
    Enc: GaussianEncoderT,
    Dec: ExpressionDecoderT,
    Prior: StructuralPriorT,
{
    fn dim_obs(&self) -> usize {
        self.encoder.dim_obs()
    }

    fn dim_latent(&self) -> usize {
        self.encoder.dim_latent()
    }

    fn latent_posterior(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let latent = self.encoder.forward_t(x_nd, false)?;
        Ok((latent.mean, latent.var))
    }

    fn decode(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        covar: &Covariates,
    ) -> Result<ExpressionParams> {
        self.decoder.forward_t(z_nk, library_n1, covar, false)
    }

    fn log_likelihood(&self, x_nd: &Tensor, params: &ExpressionParams) -> Result<Tensor> {
        self.reconstruction_loss.log_likelihood(x_nd, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_aux_layers::FcConfig;
    use crate::candle_decoder_expression::{Dispersion, ExpressionDecoder};
    use crate::candle_model_encoder::GaussianEncoder;
    use crate::candle_structural_prior::StandardNormalPrior;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn forward_loss_decomposes() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let fc = FcConfig::default();
        let enc = GaussianEncoder::new(6, 2, &[8], &fc, true, vs.clone())?;
        let dec = ExpressionDecoder::new(6, 2, &[8], &fc, Dispersion::Gene, 0, vs)?;
        let prior = StandardNormalPrior;
        let vae = Vae::build(&enc, &dec, &prior, &varmap, ReconstructionLoss::Nb)?;

        let x = Tensor::rand(0_f32, 10_f32, (5, 6), &dev)?.floor()?;
        let data = InMemoryData::new(&x)?;
        let mb = data.take_rows(&[0, 1, 2, 3, 4], &dev)?;

        let mut diag = TrainingDiagnostics::new(2);
        let out = vae.forward(&mb, true, Some(&mut diag))?;
        assert_eq!(out.reconst_loss.dims(), &[5]);
        assert_eq!(diag.len(), 1);

        let loss = out.loss.to_scalar::<f32>()?;
        let mean_recon = out.reconst_loss.mean_all()?.to_scalar::<f32>()?;
        let mp = out.structural_llik.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(loss, mean_recon - mp / 5., epsilon = 1e-3);
        assert!(loss.is_finite());
        Ok(())
    }

    #[test]
    fn training_keeps_finite_trace() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let fc = FcConfig {
            dropout_rate: 0.,
            ..FcConfig::default()
        };
        let enc = GaussianEncoder::new(4, 2, &[8], &fc, true, vs.clone())?;
        let dec = ExpressionDecoder::new(4, 2, &[8], &fc, Dispersion::Gene, 0, vs)?;
        let prior = StandardNormalPrior;
        let vae = Vae::build(&enc, &dec, &prior, &varmap, ReconstructionLoss::Poisson)?;

        let x = Tensor::new(
            &[
                [10_f32, 0., 0., 1.],
                [9., 1., 0., 0.],
                [0., 0., 12., 2.],
                [1., 0., 11., 1.],
            ],
            &dev,
        )?;
        let mut data = InMemoryData::new(&x)?;
        let config = TrainConfig {
            learning_rate: 1e-2,
            batch_size: 4,
            num_epochs: 50,
            ..TrainConfig::default()
        };
        let mut diag = TrainingDiagnostics::new(10);
        let trace = vae.train_encoder_decoder(&mut data, &config, &mut diag)?;
        assert_eq!(trace.len(), 50);
        assert_eq!(diag.len(), 10);
        assert!(trace.iter().all(|x| x.is_finite()));
        Ok(())
    }
}
