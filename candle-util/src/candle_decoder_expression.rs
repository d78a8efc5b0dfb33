use crate::candle_aux_layers::{FcConfig, StackLayers};
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, ModuleT, VarBuilder};

/// Where the inverse dispersion `θ` of each gene is shared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispersion {
    /// one `θ` per gene
    Gene,
    /// one `θ` per (gene, batch)
    GeneBatch,
    /// one `θ` per (gene, label)
    GeneLabel,
}

///////////////////////////////
// scVI-style count decoder  //
///////////////////////////////

pub struct ExpressionDecoder {
    n_features: usize,
    n_latent: usize,
    dispersion: Dispersion,
    fc: StackLayers,
    px_scale: Linear,
    px_dropout: Linear,
    /// log θ, (1 x d) or (categories x d)
    px_r: Tensor,
}

impl ExpressionDecoder {
    /// Will create a new decoder with the following parameters:
    /// * `nn.dec.fc.{}` hidden layers
    /// * `nn.dec.px_scale`, `nn.dec.px_dropout`
    /// * `px_r` log inverse dispersion
    ///
    /// `n_categories` is the number of batches (`GeneBatch`) or labels
    /// (`GeneLabel`) and ignored for `Gene`.
    pub fn new(
        n_features: usize,
        n_latent: usize,
        layers: &[usize],
        fc_config: &FcConfig,
        dispersion: Dispersion,
        n_categories: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let mut dims = vec![n_latent];
        dims.extend_from_slice(layers);
        let fc = StackLayers::build(&dims, fc_config, "nn.dec.fc", vs.clone())?;
        let prev_dim = dims[dims.len() - 1];

        let px_scale = candle_nn::linear(prev_dim, n_features, vs.pp("nn.dec.px_scale"))?;
        let px_dropout = candle_nn::linear(prev_dim, n_features, vs.pp("nn.dec.px_dropout"))?;

        let n_rows = match dispersion {
            Dispersion::Gene => 1,
            Dispersion::GeneBatch | Dispersion::GeneLabel => n_categories.max(1),
        };
        let px_r = vs.get_with_hints(
            (n_rows, n_features),
            "px_r",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;

        Ok(Self {
            n_features,
            n_latent,
            dispersion,
            fc,
            px_scale,
            px_dropout,
            px_r,
        })
    }

    pub fn dispersion(&self) -> Dispersion {
        self.dispersion
    }

    /// `exp(px_r)` looked up for each row
    fn inverse_dispersion(&self, n: usize, covar: &Covariates) -> Result<Tensor> {
        let onehot = match self.dispersion {
            Dispersion::Gene => None,
            Dispersion::GeneBatch => Some(covar.batch.ok_or_else(|| {
                candle_core::Error::Msg("gene-batch dispersion needs batch codes".into())
            })?),
            Dispersion::GeneLabel => Some(covar.label.ok_or_else(|| {
                candle_core::Error::Msg("gene-label dispersion needs label codes".into())
            })?),
        };

        match onehot {
            None => self.px_r.exp(),
            Some(onehot_nc) => {
                if onehot_nc.dims2()? != (n, self.px_r.dim(0)?) {
                    candle_core::bail!(
                        "one-hot codes {:?} vs. {} rows and {} categories",
                        onehot_nc.shape(),
                        n,
                        self.px_r.dim(0)?
                    );
                }
                onehot_nc.to_dtype(self.px_r.dtype())?.matmul(&self.px_r)?.exp()
            }
        }
    }
}

impl ExpressionDecoderT for ExpressionDecoder {
    fn forward_t(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        covar: &Covariates,
        train: bool,
    ) -> Result<ExpressionParams> {
        let h_nl = self.fc.forward_t(z_nk, train)?;
        let px_scale = ops::softmax_last_dim(&self.px_scale.forward(&h_nl)?)?;
        let px_dropout = self.px_dropout.forward(&h_nl)?;
        let px_rate = library_n1.exp()?.broadcast_mul(&px_scale)?;
        let px_r = self.inverse_dispersion(z_nk.dim(0)?, covar)?;
        Ok(ExpressionParams {
            px_scale,
            px_r,
            px_rate,
            px_dropout,
        })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    #[test]
    fn scale_is_on_simplex_and_rate_follows_library() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let dec = ExpressionDecoder::new(5, 2, &[8], &FcConfig::default(), Dispersion::Gene, 0, vs)?;

        let z = Tensor::randn(0_f32, 1_f32, (3, 2), &dev)?;
        let lib = Tensor::new(&[[0_f32], [1.], [2.]], &dev)?;
        let out = dec.forward_t(&z, &lib, &Covariates::default(), false)?;

        let row_sums = out.px_scale.sum(D::Minus1)?.to_vec1::<f32>()?;
        for s in row_sums {
            approx::assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
        let rate_sums = out.px_rate.sum(D::Minus1)?.to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(rate_sums[2], 2_f32.exp(), epsilon = 1e-4);
        assert_eq!(out.px_r.dims(), &[1, 5]);
        Ok(())
    }

    #[test]
    fn batch_dispersion_requires_codes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let dec = ExpressionDecoder::new(
            4,
            2,
            &[6],
            &FcConfig::default(),
            Dispersion::GeneBatch,
            3,
            vs,
        )?;
        let z = Tensor::zeros((2, 2), DType::F32, &dev)?;
        let lib = Tensor::zeros((2, 1), DType::F32, &dev)?;
        assert!(dec
            .forward_t(&z, &lib, &Covariates::default(), false)
            .is_err());

        let onehot = Tensor::new(&[[1_f32, 0., 0.], [0., 0., 1.]], &dev)?;
        let covar = Covariates {
            batch: Some(&onehot),
            label: None,
        };
        let out = dec.forward_t(&z, &lib, &covar, false)?;
        assert_eq!(out.px_r.dims(), &[2, 4]);
        Ok(())
    }
}
