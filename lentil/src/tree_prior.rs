use crate::message_passing::{MessageStore, Schedule};
use crate::phylo_tree::{EdgeLength, PhyloTree};

use candle_util::candle_core::{DType, Device, Error, Result, Tensor};
use candle_util::candle_model_traits::StructuralPriorT;
use std::sync::Mutex;

/// Latent codes of the tree's leaves are tied together by a Brownian
/// motion that starts from `N(0, I)` at the prior root.
///
/// Rows of `z_nk` handed to [`StructuralPriorT::structural_log_likelihood`]
/// must follow [`TreeStructuralPrior::barcodes`].
pub struct TreeStructuralPrior {
    tree: PhyloTree,
    barcodes: Vec<Box<str>>,
    edge_length: EdgeLength,
    schedule: Schedule,
    store: Mutex<MessageStore>,
}

impl TreeStructuralPrior {
    pub fn new(tree: PhyloTree, dim: usize, edge_length: EdgeLength) -> anyhow::Result<Self> {
        let barcodes = tree.leaf_names();
        let store = MessageStore::new(&tree, dim, DType::F32, &Device::Cpu)?;
        let unvisited = vec![false; tree.num_nodes()];
        let schedule = Schedule::build(&tree, tree.root(), false, &unvisited)?;
        Ok(Self {
            tree,
            barcodes,
            edge_length,
            schedule,
            store: Mutex::new(store),
        })
    }

    pub fn tree(&self) -> &PhyloTree {
        &self.tree
    }

    /// leaf names in the row order the prior expects
    pub fn barcodes(&self) -> &[Box<str>] {
        &self.barcodes
    }

    pub fn num_leaves(&self) -> usize {
        self.barcodes.len()
    }

    pub fn edge_length(&self) -> EdgeLength {
        self.edge_length
    }

    pub fn dim(&self) -> Result<usize> {
        Ok(self.lock()?.dim())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MessageStore>> {
        self.store
            .lock()
            .map_err(|e| Error::Msg(format!("message store poisoned: {}", e)))
    }

    /// Predictive `(mu, nu)` of node `query`. Leaf codes are taken from
    /// `evidence_nk` when given (rows in [`Self::barcodes`] order),
    /// otherwise from the last evidence the prior was evaluated on.
    pub fn posterior_predictive_density(
        &self,
        query: &str,
        evidence_nk: Option<&Tensor>,
    ) -> Result<(Tensor, f64)> {
        let query = self
            .tree
            .id_of(query)
            .ok_or_else(|| Error::Msg(format!("unknown node {}", query)))?;
        let mut store = self.lock()?;
        let evidence = evidence_nk.map(|z| (z, self.barcodes.as_slice()));
        store.posterior_predictive_density(&self.tree, query, evidence, self.edge_length)
    }
}

impl StructuralPriorT for TreeStructuralPrior {
    fn structural_log_likelihood(&self, z_nk: &Tensor) -> Result<Tensor> {
        let mut store = self.lock()?;
        store.initialize_messages(&self.tree, z_nk, &self.barcodes)?;
        store.initialize_visit();
        store.pass_messages(&self.tree, &self.schedule, self.edge_length)?;
        store.aggregate_messages_into_leaves_likelihood(&self.tree, true, self.edge_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_newick;

    #[test]
    fn balanced_tree_likelihood_is_deterministic() -> anyhow::Result<()> {
        let tree = parse_newick("((A,B)X,(C,D)Y)R;")?;
        let prior = TreeStructuralPrior::new(tree, 1, EdgeLength::Unit)?;

        // evidence follows the prior's own barcode order
        let values: Vec<f64> = prior
            .barcodes()
            .iter()
            .map(|b| match b.as_ref() {
                "A" | "C" => 0.,
                _ => 2.,
            })
            .collect();
        let z = Tensor::from_vec(values, (4, 1), &Device::Cpu)?;

        let first = prior.structural_log_likelihood(&z)?.to_scalar::<f64>()?;
        let second = prior.structural_log_likelihood(&z)?.to_scalar::<f64>()?;
        assert!(first.is_finite());
        assert_eq!(first, second);

        // X and Y both see (0, 2) at ν = 1: log N(0; 2, 2) each, both
        // forward mu 1 with ν 1.5 to R: log N(1; 1, 3), then the prior
        // at ν = 0.75 + 1
        let two_pi = 2. * std::f64::consts::PI;
        let pair = -0.5 * (two_pi * 2.).ln() - 0.5 * 4. / 2.;
        let root = -0.5 * (two_pi * 3.).ln();
        let top = -0.5 * (two_pi * 1.75).ln() - 0.5 * 1. / 1.75;
        approx::assert_abs_diff_eq!(first, 2. * pair + root + top, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn predictive_density_at_internal_node() -> anyhow::Result<()> {
        let tree = parse_newick("((A,B)X,C)R;")?;
        let prior = TreeStructuralPrior::new(tree, 2, EdgeLength::Unit)?;
        let z = Tensor::ones((3, 2), DType::F64, &Device::Cpu)?;
        let (mu, nu) = prior.posterior_predictive_density("X", Some(&z))?;
        assert_eq!(mu.dims(), &[2]);
        assert!(nu > 0. && nu < 1.);
        assert!(prior.posterior_predictive_density("nowhere", None).is_err());
        Ok(())
    }

    #[test]
    fn predictive_density_reuses_forward_evidence() -> anyhow::Result<()> {
        let tree = parse_newick("((A,B)X,C)R;")?;
        let prior = TreeStructuralPrior::new(tree, 1, EdgeLength::Unit)?;
        let values: Vec<f64> = prior
            .barcodes()
            .iter()
            .map(|b| match b.as_ref() {
                "A" => 5.,
                "B" => -3.,
                _ => 1.,
            })
            .collect();
        let z = Tensor::from_vec(values, (3, 1), &Device::Cpu)?;

        let (given, _) = prior.posterior_predictive_density("B", Some(&z))?;
        prior.structural_log_likelihood(&z)?;
        let (reused, _) = prior.posterior_predictive_density("B", None)?;
        prior.posterior_predictive_density("A", None)?;
        let (after_leaf, _) = prior.posterior_predictive_density("B", None)?;

        let given = given.to_vec1::<f64>()?;
        approx::assert_abs_diff_eq!(given[0], 3.2, epsilon = 1e-12);
        assert_eq!(reused.to_vec1::<f64>()?, given);
        assert_eq!(after_leaf.to_vec1::<f64>()?, given);
        Ok(())
    }

    #[test]
    fn wrong_number_of_rows_is_an_error() -> anyhow::Result<()> {
        let tree = parse_newick("((A,B)X,C)R;")?;
        let prior = TreeStructuralPrior::new(tree, 2, EdgeLength::Unit)?;
        let z = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        assert!(prior.structural_log_likelihood(&z).is_err());
        Ok(())
    }
}
