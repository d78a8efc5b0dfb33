use candle_core::{Result, Tensor};

/// Diagonal Gaussian posterior `q(z|x)` with one reparameterised draw
pub struct LatentGaussian {
    /// posterior mean (n x k)
    pub mean: Tensor,
    /// posterior variance (n x k)
    pub var: Tensor,
    /// `mean + sqrt(var) * eps` in training mode, otherwise `mean`
    pub sample: Tensor,
}

pub trait GaussianEncoderT {
    /// An encoder that maps counts to a diagonal Gaussian posterior
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm statistics and to sample
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<LatentGaussian>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// Parameters of the count distribution emitted by a decoder
pub struct ExpressionParams {
    /// normalised expression on the simplex (n x d)
    pub px_scale: Tensor,
    /// inverse dispersion, broadcastable to (n x d)
    pub px_r: Tensor,
    /// mean counts `exp(library) * px_scale` (n x d)
    pub px_rate: Tensor,
    /// zero-inflation logits (n x d)
    pub px_dropout: Tensor,
}

/// Per-cell categorical covariates as one-hot matrices
#[derive(Default, Clone, Copy)]
pub struct Covariates<'a> {
    pub batch: Option<&'a Tensor>,
    pub label: Option<&'a Tensor>,
}

pub trait ExpressionDecoderT {
    /// Decode latent states into count-distribution parameters
    ///
    /// * `z_nk` - latent states (n x k)
    /// * `library_n1` - log library size (n x 1)
    /// * `covar` - one-hot batch/label codes for dispersion lookup
    fn forward_t(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        covar: &Covariates,
        train: bool,
    ) -> Result<ExpressionParams>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// A prior over a whole minibatch of latent codes
pub trait StructuralPriorT {
    /// Joint log-density of `z_nk`; returns a scalar tensor.
    /// Row order is whatever the prior was built for.
    fn structural_log_likelihood(&self, z_nk: &Tensor) -> Result<Tensor>;
}

/// What a trained generative model exposes to posterior samplers
pub trait GenerativeModelT {
    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;

    /// posterior mean and variance of `q(z|x)` in evaluation mode
    fn latent_posterior(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)>;

    /// decode in evaluation mode
    fn decode(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        covar: &Covariates,
    ) -> Result<ExpressionParams>;

    /// per-row `log p(x|params)`
    fn log_likelihood(&self, x_nd: &Tensor, params: &ExpressionParams) -> Result<Tensor>;
}
