//! Small deterministic model and data shared by unit tests

use candle_util::candle_core::{Device, Result, Tensor};
use candle_util::candle_data_loader::{CategoricalCodes, InMemoryData};
use candle_util::candle_loss_functions::poisson_log_likelihood;
use candle_util::candle_model_traits::*;

/// fixed linear encoder/decoder over 4 genes and 2 latent dimensions
pub struct ToyModel {
    w_gk: Tensor,
    b_kg: Tensor,
}

impl ToyModel {
    pub fn new(dev: &Device) -> Result<Self> {
        let w_gk = Tensor::new(&[[0.5_f32, 0.], [0., 0.5], [0.2, 0.], [0., 0.2]], dev)?;
        let b_kg = Tensor::new(&[[1_f32, -1., 0.5, 0.], [-1., 1., 0., 0.5]], dev)?;
        Ok(Self { w_gk, b_kg })
    }
}

impl GenerativeModelT for ToyModel {
    fn dim_obs(&self) -> usize {
        4
    }

    fn dim_latent(&self) -> usize {
        2
    }

    fn latent_posterior(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let mean = (x_nd + 1.)?.log()?.matmul(&self.w_gk)?;
        let var = (mean.ones_like()? * 0.5)?;
        Ok((mean, var))
    }

    fn decode(&self, z_nk: &Tensor, library_n1: &Tensor, _covar: &Covariates) -> Result<ExpressionParams> {
        let px_scale = candle_util::candle_nn::ops::softmax_last_dim(&z_nk.matmul(&self.b_kg)?)?;
        let px_rate = library_n1.exp()?.broadcast_mul(&px_scale)?;
        Ok(ExpressionParams {
            px_r: px_scale.ones_like()?,
            px_dropout: px_scale.zeros_like()?,
            px_scale,
            px_rate,
        })
    }

    fn log_likelihood(&self, x_nd: &Tensor, params: &ExpressionParams) -> Result<Tensor> {
        poisson_log_likelihood(x_nd, &params.px_rate)
    }
}

/// 24 cells of two alternating types; cells 12.. belong to batch 1
pub fn toy_data(dev: &Device) -> anyhow::Result<InMemoryData> {
    let mut values = Vec::with_capacity(24 * 4);
    for i in 0..24 {
        let a = (i % 5) as f32;
        if i % 2 == 0 {
            values.extend_from_slice(&[8. + a, 1., 3., 0.]);
        } else {
            values.extend_from_slice(&[1., 9. + a, 0., 2.]);
        }
    }
    let x = Tensor::from_vec(values, (24, 4), dev)?;
    let batch = CategoricalCodes::new((0..24).map(|i| usize::from(i >= 12)).collect());
    InMemoryData::new(&x)?.with_batch(batch)
}
