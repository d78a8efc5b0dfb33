use crate::candle_loss_functions::standard_normal_log_density;
use crate::candle_model_traits::StructuralPriorT;
use candle_core::{Result, Tensor};

/// Independent `N(0, I)` prior on every row
#[derive(Default, Clone, Copy, Debug)]
pub struct StandardNormalPrior;

impl StructuralPriorT for StandardNormalPrior {
    fn structural_log_likelihood(&self, z_nk: &Tensor) -> Result<Tensor> {
        standard_normal_log_density(z_nk)?.sum_all()
    }
}
