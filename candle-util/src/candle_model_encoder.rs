use crate::candle_aux_layers::{FcConfig, StackLayers};
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

/// Minimum posterior variance added after the `exp` link
pub const MIN_LATENT_VARIANCE: f64 = 1e-4;

pub struct GaussianEncoder {
    n_features: usize,
    n_latent: usize,
    log_variational: bool,
    fc: StackLayers,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl GaussianEncoderT for GaussianEncoder {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<LatentGaussian> {
        let (mean, var) = self.latent_gaussian_params(x_nd, train)?;
        let sample = self.reparameterize(&mean, &var, train)?;
        Ok(LatentGaussian { mean, var, sample })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl GaussianEncoder {
    ///
    /// Evaluate latent Gaussian parameters: mean and variance
    /// z ~ N(mu(x), exp(lnvar(x)) + eps)
    pub fn latent_gaussian_params(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let x_nd = if self.log_variational {
            (x_nd + 1.)?.log()?
        } else {
            x_nd.clone()
        };
        let h_nl = self.fc.forward_t(&x_nd, train)?;
        let z_mean_nk = self.z_mean.forward(&h_nl)?;
        let z_var_nk = (self.z_lnvar.forward(&h_nl)?.clamp(-15., 15.)?.exp()? + MIN_LATENT_VARIANCE)?;
        Ok((z_mean_nk, z_var_nk))
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    pub fn reparameterize(&self, z_mean: &Tensor, z_var: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            let eps = Tensor::randn_like(z_mean, 0., 1.)?;
            z_mean + (z_var.sqrt()? * eps)?
        } else {
            Ok(z_mean.clone())
        }
    }

    /// Will create a new Gaussian encoder module
    /// with these variables:
    ///
    /// * `nn.enc.fc.{}.linear.weight` where {} is the layer index
    /// * `nn.enc.z.mean.weight`
    /// * `nn.enc.z.lnvar.weight`
    pub fn new(
        n_features: usize,
        n_latent: usize,
        layers: &[usize],
        fc_config: &FcConfig,
        log_variational: bool,
        vs: VarBuilder,
    ) -> Result<Self> {
        if layers.is_empty() {
            candle_core::bail!("encoder needs at least one hidden layer");
        }

        let mut dims = vec![n_features];
        dims.extend_from_slice(layers);
        let fc = StackLayers::build(&dims, fc_config, "nn.enc.fc", vs.clone())?;

        let prev_dim = dims[dims.len() - 1];
        let z_mean = candle_nn::linear(prev_dim, n_latent, vs.pp("nn.enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(prev_dim, n_latent, vs.pp("nn.enc.z.lnvar"))?;

        Ok(Self {
            n_features,
            n_latent,
            log_variational,
            fc,
            z_mean,
            z_lnvar,
        })
    }
}
