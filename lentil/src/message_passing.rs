//! Exact Gaussian belief propagation over a [`PhyloTree`].
//!
//! Every node `i` carries a message `N(mu_i, nu_i I)` together with the
//! log normaliser `log_z_i` produced when its incoming messages were
//! multiplied. Leaves are observations (`nu = 0`); each edge adds its
//! length to the variance of a message travelling across it.
//!
//! A pass is split in two phases:
//! 1. [`Schedule::build`] walks outward from a root with an explicit
//!    stack and records, for every reached node, which neighbours send
//!    it a message;
//! 2. [`MessageStore::pass_messages`] replays that record in reverse so
//!    that every node is combined after all of its senders.
//!
//! `nu` only depends on the topology, so it is kept as `f64`; `mu` and
//! `log_z` are tensors and carry gradients back to the evidence.

use crate::phylo_tree::{EdgeLength, PhyloTree};
use candle_util::candle_core::{bail, DType, Device, Result, Tensor};
use std::f64::consts::PI;

/// Order in which messages are combined for one pass
#[derive(Clone, Debug)]
pub struct Schedule {
    root: usize,
    include_prior: bool,
    /// `(node, senders)` in post-order: senders always appear before
    /// the node they send to
    steps: Vec<(usize, Vec<usize>)>,
}

impl Schedule {
    /// Walk outward from `root` over neighbours not yet `visited`.
    /// Children come before the parent; the prior root is only entered
    /// when `include_prior` is set.
    pub fn build(
        tree: &PhyloTree,
        root: usize,
        include_prior: bool,
        visited: &[bool],
    ) -> Result<Self> {
        let n = tree.num_nodes();
        if root >= n || visited.len() != n {
            bail!("root {} / visit flags {} for {} nodes", root, visited.len(), n);
        }

        let mut seen = visited.to_vec();
        seen[root] = true;

        let mut preorder = Vec::with_capacity(n);
        let mut stack = vec![root];

        while let Some(u) = stack.pop() {
            let senders: Vec<usize> = tree
                .neighbours(u, include_prior)
                .filter(|&v| !seen[v])
                .collect();
            for &v in senders.iter() {
                seen[v] = true;
            }
            stack.extend(senders.iter().rev());
            preorder.push((u, senders));
        }

        preorder.reverse();

        Ok(Self {
            root,
            include_prior,
            steps: preorder,
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn include_prior(&self) -> bool {
        self.include_prior
    }

    /// nodes in the order they are combined
    pub fn nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.steps.iter().map(|(u, _)| *u)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Per-node message state, indexed by node id
pub struct MessageStore {
    pub nu: Vec<f64>,
    pub mu: Vec<Tensor>,
    pub log_z: Vec<Tensor>,
    pub visited: Vec<bool>,
    /// leaf codes of the last [`MessageStore::initialize_messages`]
    evidence: Option<(Tensor, Vec<Box<str>>)>,
    dim: usize,
    dtype: DType,
    device: Device,
}

impl MessageStore {
    pub fn new(tree: &PhyloTree, dim: usize, dtype: DType, device: &Device) -> Result<Self> {
        let n = tree.num_nodes();
        let zero_mu = Tensor::zeros(dim, dtype, device)?;
        let zero = Tensor::zeros((), dtype, device)?;
        Ok(Self {
            nu: vec![0.; n],
            mu: vec![zero_mu; n],
            log_z: vec![zero; n],
            visited: vec![false; n],
            evidence: None,
            dim,
            dtype,
            device: device.clone(),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Reset every node to `nu = 0, mu = 0, log_z = 0` and place the rows
    /// of `evidence_nd` on the leaves named by `barcodes`.
    ///
    /// The store adopts the dtype and device of `evidence_nd` and keeps
    /// a detached copy for later predictive passes.
    pub fn initialize_messages(
        &mut self,
        tree: &PhyloTree,
        evidence_nd: &Tensor,
        barcodes: &[Box<str>],
    ) -> Result<()> {
        let (n, d) = evidence_nd.dims2()?;
        if n != barcodes.len() {
            bail!("{} evidence rows for {} barcodes", n, barcodes.len());
        }
        if d != self.dim {
            bail!("evidence width {} vs. latent dimension {}", d, self.dim);
        }
        if tree.num_nodes() != self.nu.len() {
            bail!("message store built for a different tree");
        }

        self.dtype = evidence_nd.dtype();
        self.device = evidence_nd.device().clone();

        let zero_mu = Tensor::zeros(self.dim, self.dtype, &self.device)?;
        let zero = Tensor::zeros((), self.dtype, &self.device)?;
        self.nu.fill(0.);
        self.mu.fill(zero_mu);
        self.log_z.fill(zero);

        for (i, barcode) in barcodes.iter().enumerate() {
            let id = match tree.id_of(barcode) {
                Some(id) if tree.is_leaf(id) => id,
                Some(_) => bail!("barcode {} names an internal node", barcode),
                None => bail!("unknown barcode {}", barcode),
            };
            self.mu[id] = evidence_nd.get(i)?;
        }
        self.evidence = Some((evidence_nd.detach(), barcodes.to_vec()));
        Ok(())
    }

    pub fn initialize_visit(&mut self) {
        self.visited.fill(false);
    }

    /// Radiate messages towards `root` from every node reachable
    /// through unvisited neighbours
    pub fn perform_message_passing(
        &mut self,
        tree: &PhyloTree,
        root: usize,
        include_prior: bool,
        edge_length: EdgeLength,
    ) -> Result<()> {
        let schedule = Schedule::build(tree, root, include_prior, &self.visited)?;
        self.pass_messages(tree, &schedule, edge_length)
    }

    /// Replay a precomputed schedule
    pub fn pass_messages(
        &mut self,
        tree: &PhyloTree,
        schedule: &Schedule,
        edge_length: EdgeLength,
    ) -> Result<()> {
        for (u, senders) in schedule.steps.iter() {
            self.visited[*u] = true;
            self.combine(tree, *u, senders, edge_length)?;
        }
        Ok(())
    }

    /// Product of the incoming Gaussian messages at `u`
    fn combine(
        &mut self,
        tree: &PhyloTree,
        u: usize,
        senders: &[usize],
        edge_length: EdgeLength,
    ) -> Result<()> {
        match senders.len() {
            0 => Ok(()),
            1 => {
                let c = senders[0];
                self.nu[u] = self.nu[c] + tree.edge_length(u, c, edge_length);
                self.mu[u] = self.mu[c].clone();
                self.log_z[u] = Tensor::zeros((), self.dtype, &self.device)?;
                Ok(())
            }
            n => {
                let d = self.dim as f64;

                let nus: Vec<f64> = senders
                    .iter()
                    .map(|&c| self.nu[c] + tree.edge_length(u, c, edge_length))
                    .collect();

                if let Some(bad) = nus.iter().find(|&&v| !(v > 0. && v.is_finite())) {
                    bail!("non-positive message variance {} at {}", bad, tree.node(u).name);
                }

                // S = Σ 1/ν_k, combined variance 1/S
                let prec_sum: f64 = nus.iter().map(|v| 1. / v).sum();
                let nu = 1. / prec_sum;

                let mut weighted = self.mu[senders[0]].affine(1. / nus[0], 0.)?;
                for (&c, &v) in senders.iter().zip(nus.iter()).skip(1) {
                    weighted = (weighted + self.mu[c].affine(1. / v, 0.)?)?;
                }
                let mu = weighted.affine(nu, 0.)?;

                // t = Σ_k Π_{j≠k} ν_j = Π ν · S
                let log_t: f64 = nus.iter().map(|v| v.ln()).sum::<f64>() + prec_sum.ln();
                let z1 = -0.5 * (n as f64 - 1.) * d * (2. * PI).ln();
                let z2 = -0.5 * d * log_t;

                // Π_{k∉{j,h}} ν_k / t = 1 / (ν_j ν_h S)
                let mut z3 = Tensor::zeros((), self.dtype, &self.device)?;
                for j in 0..n {
                    for h in (j + 1)..n {
                        let sq = (&self.mu[senders[j]] - &self.mu[senders[h]])?
                            .sqr()?
                            .sum_all()?;
                        z3 = (z3 + sq.affine(1. / (nus[j] * nus[h]), 0.)?)?;
                    }
                }
                let log_z = z3.affine(-0.5 / prec_sum, z1 + z2)?;

                self.nu[u] = nu;
                self.mu[u] = mu;
                self.log_z[u] = log_z;
                Ok(())
            }
        }
    }

    /// Σ_i log_z_i over every node; with `add_prior` the biological root's
    /// message is also scored against `N(0, I)` one edge above it
    pub fn aggregate_messages_into_leaves_likelihood(
        &self,
        tree: &PhyloTree,
        add_prior: bool,
        edge_length: EdgeLength,
    ) -> Result<Tensor> {
        let mut llik = Tensor::stack(&self.log_z, 0)?.sum_all()?;
        if add_prior {
            let root = tree.root();
            let var = self.nu[root] + tree.edge_length(root, tree.prior_root(), edge_length);
            let d = self.dim as f64;
            let prior = self.mu[root]
                .sqr()?
                .sum_all()?
                .affine(-0.5 / var, -0.5 * d * (2. * PI * var).ln())?;
            llik = (llik + prior)?;
        }
        Ok(llik)
    }

    /// Predictive `(mu, nu)` of node `query` given every leaf.
    ///
    /// Messages are always rebuilt, from `evidence` when given and
    /// otherwise from the evidence last loaded into the store, since a
    /// pass towards a leaf overwrites that leaf's own message.
    pub fn posterior_predictive_density(
        &mut self,
        tree: &PhyloTree,
        query: usize,
        evidence: Option<(&Tensor, &[Box<str>])>,
        edge_length: EdgeLength,
    ) -> Result<(Tensor, f64)> {
        if query >= tree.num_nodes() {
            bail!("query node {} out of range", query);
        }
        match evidence {
            Some((evidence_nd, barcodes)) => {
                self.initialize_messages(tree, evidence_nd, barcodes)?;
            }
            None => {
                let Some((evidence_nd, barcodes)) = self.evidence.clone() else {
                    bail!("no leaf evidence loaded for a predictive pass");
                };
                self.initialize_messages(tree, &evidence_nd, &barcodes)?;
            }
        }
        self.initialize_visit();
        self.perform_message_passing(tree, query, true, edge_length)?;
        Ok((self.mu[query].clone(), self.nu[query]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_from(names: &[&str], parents: &[Option<usize>]) -> PhyloTree {
        PhyloTree::from_parents(
            names.iter().map(|&s| s.into()).collect(),
            parents.to_vec(),
            vec![None; names.len()],
        )
        .unwrap()
    }

    fn barcodes(names: &[&str]) -> Vec<Box<str>> {
        names.iter().map(|&s| s.into()).collect()
    }

    fn scalar(t: &Tensor) -> f64 {
        t.to_scalar::<f64>().unwrap()
    }

    #[test]
    fn two_children_closed_form() -> Result<()> {
        // two leaves directly below R reach it with ν = 0 + 1
        let tree = tree_from(&["R", "A", "B"], &[None, Some(0), Some(0)]);
        let dev = Device::Cpu;
        let evidence = Tensor::new(&[[0_f64, 0.], [1., 1.]], &dev)?;

        let mut store = MessageStore::new(&tree, 2, DType::F64, &dev)?;
        store.initialize_messages(&tree, &evidence, &barcodes(&["A", "B"]))?;
        store.initialize_visit();
        store.perform_message_passing(&tree, tree.root(), false, EdgeLength::Unit)?;

        let root = tree.root();
        let expected = -(4. * PI).ln() - 0.5;
        approx::assert_abs_diff_eq!(scalar(&store.log_z[root]), expected, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(store.nu[root], 0.5, epsilon = 1e-12);
        assert_eq!(store.mu[root].to_vec1::<f64>()?, vec![0.5, 0.5]);
        Ok(())
    }

    #[test]
    fn closed_form_matches_gaussian_product_integral() -> Result<()> {
        // ∫ N(x; m1, v1) N(x; m2, v2) dx = N(m1; m2, v1 + v2)
        let tree = tree_from(&["R", "A", "B"], &[None, Some(0), Some(0)]);
        let dev = Device::Cpu;
        let names = ["R", "A", "B"];
        let (m1, m2) = (0.3_f64, -1.2_f64);
        let evidence = Tensor::new(&[[m1], [m2]], &dev)?;

        let mut store = MessageStore::new(&tree, 1, DType::F64, &dev)?;
        store.initialize_messages(&tree, &evidence, &barcodes(&names[1..]))?;
        store.initialize_visit();
        store.perform_message_passing(&tree, tree.root(), false, EdgeLength::Unit)?;

        let v = 2.;
        let expected = -0.5 * (2. * PI * v).ln() - 0.5 * (m1 - m2).powi(2) / v;
        approx::assert_abs_diff_eq!(scalar(&store.log_z[tree.root()]), expected, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn single_child_passes_through() -> Result<()> {
        let tree = tree_from(&["R", "P", "A", "B"], &[None, Some(0), Some(1), Some(0)]);
        let dev = Device::Cpu;
        let evidence = Tensor::new(&[[2_f64, -1.], [0., 0.]], &dev)?;

        let mut store = MessageStore::new(&tree, 2, DType::F64, &dev)?;
        store.initialize_messages(&tree, &evidence, &barcodes(&["A", "B"]))?;
        store.initialize_visit();
        store.perform_message_passing(&tree, tree.root(), false, EdgeLength::Unit)?;

        let p = tree.id_of("P").unwrap();
        let a = tree.id_of("A").unwrap();
        assert_eq!(store.mu[p].to_vec1::<f64>()?, store.mu[a].to_vec1::<f64>()?);
        assert_eq!(store.nu[p], store.nu[a] + 1.);
        assert_eq!(scalar(&store.log_z[p]), 0.);
        Ok(())
    }

    #[test]
    fn aggregation_is_order_free() -> Result<()> {
        let tree = tree_from(
            &["R", "X", "Y", "A", "B", "C", "D", "E"],
            &[None, Some(0), Some(0), Some(1), Some(1), Some(2), Some(2), Some(2)],
        );
        let dev = Device::Cpu;
        let evidence = Tensor::new(&[[0.1_f64], [0.7], [-0.4], [1.5], [0.0]], &dev)?;
        let leaves = barcodes(&["A", "B", "C", "D", "E"]);

        let mut store = MessageStore::new(&tree, 1, DType::F64, &dev)?;
        store.initialize_messages(&tree, &evidence, &leaves)?;
        store.initialize_visit();
        store.perform_message_passing(&tree, tree.root(), false, EdgeLength::Unit)?;

        let total = scalar(&store.aggregate_messages_into_leaves_likelihood(
            &tree,
            false,
            EdgeLength::Unit,
        )?);
        let forward: f64 = store.log_z.iter().map(scalar).sum();
        let backward: f64 = store.log_z.iter().rev().map(scalar).sum();
        approx::assert_abs_diff_eq!(total, forward, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(total, backward, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn prior_root_only_visited_when_included() -> Result<()> {
        let tree = tree_from(&["R", "A", "B"], &[None, Some(0), Some(0)]);
        let dev = Device::Cpu;
        let evidence = Tensor::new(&[[1_f64], [3.]], &dev)?;
        let leaves = barcodes(&["A", "B"]);
        let pr = tree.prior_root();

        let mut store = MessageStore::new(&tree, 1, DType::F64, &dev)?;
        store.initialize_messages(&tree, &evidence, &leaves)?;
        store.initialize_visit();
        store.perform_message_passing(&tree, tree.root(), false, EdgeLength::Unit)?;
        assert!(!store.visited[pr]);
        assert_eq!(store.nu[pr], 0.);
        assert_eq!(store.mu[pr].to_vec1::<f64>()?, vec![0.]);

        let a = tree.id_of("A").unwrap();
        let (mu, nu) =
            store.posterior_predictive_density(&tree, a, Some((&evidence, &leaves)), EdgeLength::Unit)?;
        assert!(store.visited[pr]);
        // R combines B (ν=1, mu=3) with the prior (ν=1, mu=0): mu 1.5, ν 0.5;
        // A sits one more edge away
        approx::assert_abs_diff_eq!(mu.to_vec1::<f64>()?[0], 1.5, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(nu, 1.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn leaf_query_keeps_evidence_for_later_queries() -> Result<()> {
        // ((A,B)X,C)R
        let tree = tree_from(
            &["R", "X", "C", "A", "B"],
            &[None, Some(0), Some(0), Some(1), Some(1)],
        );
        let dev = Device::Cpu;
        let evidence = Tensor::new(&[[5_f64], [-3.], [1.]], &dev)?;
        let leaves = barcodes(&["A", "B", "C"]);
        let (a, b) = (tree.id_of("A").unwrap(), tree.id_of("B").unwrap());

        let mut store = MessageStore::new(&tree, 1, DType::F64, &dev)?;
        assert!(store
            .posterior_predictive_density(&tree, b, None, EdgeLength::Unit)
            .is_err());

        let (mu_b, nu_b) =
            store.posterior_predictive_density(&tree, b, Some((&evidence, &leaves)), EdgeLength::Unit)?;
        // R: C and the prior give mu 0.5, ν 0.5; X: A (ν 1) with R (ν 1.5)
        approx::assert_abs_diff_eq!(mu_b.to_vec1::<f64>()?[0], 3.2, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(nu_b, 1.6, epsilon = 1e-12);

        // a pass towards A overwrites A's own message
        store.posterior_predictive_density(&tree, a, None, EdgeLength::Unit)?;
        let (again, nu_again) = store.posterior_predictive_density(&tree, b, None, EdgeLength::Unit)?;
        assert_eq!(again.to_vec1::<f64>()?, mu_b.to_vec1::<f64>()?);
        assert_eq!(nu_again, nu_b);
        assert_eq!(store.mu[a].to_vec1::<f64>()?, vec![5.]);
        Ok(())
    }

    #[test]
    fn unknown_barcode_and_bad_shapes_are_errors() -> Result<()> {
        let tree = tree_from(&["R", "A", "B"], &[None, Some(0), Some(0)]);
        let dev = Device::Cpu;
        let mut store = MessageStore::new(&tree, 2, DType::F64, &dev)?;

        let evidence = Tensor::zeros((2, 2), DType::F64, &dev)?;
        assert!(store
            .initialize_messages(&tree, &evidence, &barcodes(&["A", "Z"]))
            .is_err());
        assert!(store
            .initialize_messages(&tree, &evidence, &barcodes(&["A"]))
            .is_err());
        assert!(store
            .initialize_messages(&tree, &evidence, &barcodes(&["A", "R"]))
            .is_err());

        let narrow = Tensor::zeros((2, 3), DType::F64, &dev)?;
        assert!(store
            .initialize_messages(&tree, &narrow, &barcodes(&["A", "B"]))
            .is_err());
        Ok(())
    }

    #[test]
    fn deep_caterpillar_does_not_overflow() -> Result<()> {
        // spine of 5k internal nodes, each with one extra leaf
        let depth = 5_000;
        let mut names: Vec<Box<str>> = vec![];
        let mut parents = vec![];
        for i in 0..depth {
            names.push(format!("s{}", i).into());
            parents.push(if i == 0 { None } else { Some(2 * (i - 1)) });
            names.push(format!("l{}", i).into());
            parents.push(Some(2 * i));
        }
        let tree = PhyloTree::from_parents(names, parents, vec![None; 2 * depth]).unwrap();
        let leaves = tree.leaf_names();
        let dev = Device::Cpu;
        let evidence = Tensor::zeros((leaves.len(), 1), DType::F64, &dev)?;

        let mut store = MessageStore::new(&tree, 1, DType::F64, &dev)?;
        store.initialize_messages(&tree, &evidence, &leaves)?;
        store.initialize_visit();
        store.perform_message_passing(&tree, tree.root(), false, EdgeLength::Unit)?;
        let llik = scalar(&store.aggregate_messages_into_leaves_likelihood(
            &tree,
            true,
            EdgeLength::Unit,
        )?);
        assert!(llik.is_finite());
        Ok(())
    }
}
