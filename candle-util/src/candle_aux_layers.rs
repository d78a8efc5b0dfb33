use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};

pub fn default_batch_norm_config() -> candle_nn::BatchNormConfig {
    candle_nn::BatchNormConfig {
        eps: 1e-3,
        remove_mean: true,
        affine: true,
        momentum: 0.01,
    }
}

/// One fully-connected block: `Linear -> [BatchNorm] -> [act] -> [Dropout]`
pub struct FcLayer {
    linear: Linear,
    batch_norm: Option<BatchNorm>,
    activation: Option<Activation>,
    dropout: Option<Dropout>,
}

impl ModuleT for FcLayer {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.linear.forward(input)?;
        if let Some(bn) = &self.batch_norm {
            x = bn.forward_t(&x, train)?;
        }
        if let Some(act) = &self.activation {
            x = act.forward(&x)?;
        }
        if let Some(dropout) = &self.dropout {
            x = dropout.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

/// build a stack of fully-connected blocks
pub struct StackLayers {
    layers: Vec<FcLayer>,
}

impl ModuleT for StackLayers {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in self.layers.iter() {
            x = layer.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

/// Options shared by every block of a [`StackLayers`]
#[derive(Clone, Debug)]
pub struct FcConfig {
    pub use_batch_norm: bool,
    pub activation: Option<Activation>,
    pub dropout_rate: f32,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            use_batch_norm: true,
            activation: Some(Activation::Relu),
            dropout_rate: 0.1,
        }
    }
}

impl StackLayers {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Build `dims.len() - 1` blocks mapping `dims[j] -> dims[j+1]`;
    /// parameters live under `{prefix}.{j}`.
    pub fn build(dims: &[usize], config: &FcConfig, prefix: &str, vs: VarBuilder) -> Result<Self> {
        let mut ret = Self::new();
        for (j, w) in dims.windows(2).enumerate() {
            let vs_j = vs.pp(format!("{}.{}", prefix, j));
            let linear = candle_nn::linear(w[0], w[1], vs_j.pp("linear"))?;
            let batch_norm = if config.use_batch_norm {
                Some(candle_nn::batch_norm(
                    w[1],
                    default_batch_norm_config(),
                    vs_j.pp("bn"),
                )?)
            } else {
                None
            };
            let dropout = (config.dropout_rate > 0.).then(|| Dropout::new(config.dropout_rate));
            ret.layers.push(FcLayer {
                linear,
                batch_norm,
                activation: config.activation,
                dropout,
            });
        }
        Ok(ret)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Default for StackLayers {
    fn default() -> Self {
        Self::new()
    }
}
