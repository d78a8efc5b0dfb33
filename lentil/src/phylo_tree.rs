//! Arena representation of a rooted lineage tree.
//!
//! Nodes live in one `Vec` and refer to each other by index. On
//! construction a synthetic *prior root* is attached above the
//! biological root; it carries the `N(0, I)` prior during message
//! passing and is otherwise skipped.

use std::collections::HashMap;

/// name of the synthetic node holding the latent prior
pub const PRIOR_ROOT_NAME: &str = "__prior_root__";

/// smallest branch length used when branch lengths are honoured
pub const MIN_BRANCH_LENGTH: f64 = 1e-6;

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub name: Box<str>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// length of the edge to `parent`
    pub branch_length: Option<f64>,
    /// cell barcodes this node stands for; a leaf owns itself unless
    /// it is a collapsed clade
    pub cells: Vec<Box<str>>,
}

/// How long the edge between a node and its parent is taken to be
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EdgeLength {
    /// every edge adds unit variance
    #[default]
    Unit,
    /// use the tree's branch lengths; missing lengths count as one
    Branch,
}

#[derive(Clone, Debug)]
pub struct PhyloTree {
    nodes: Vec<TreeNode>,
    name_to_id: HashMap<Box<str>, usize>,
    root: usize,
    prior_root: usize,
}

impl PhyloTree {
    /// Build a tree from parallel vectors of names, parent indexes and
    /// branch lengths. Exactly one node may lack a parent.
    pub fn from_parents(
        names: Vec<Box<str>>,
        parents: Vec<Option<usize>>,
        branch_lengths: Vec<Option<f64>>,
    ) -> anyhow::Result<Self> {
        let n = names.len();
        if n == 0 {
            return Err(anyhow::anyhow!("empty tree"));
        }
        if parents.len() != n || branch_lengths.len() != n {
            return Err(anyhow::anyhow!(
                "{} names, {} parents, {} branch lengths",
                n,
                parents.len(),
                branch_lengths.len()
            ));
        }

        let mut name_to_id: HashMap<Box<str>, usize> = HashMap::with_capacity(n + 1);
        for (i, name) in names.iter().enumerate() {
            if name.as_ref() == PRIOR_ROOT_NAME {
                return Err(anyhow::anyhow!("reserved node name {}", PRIOR_ROOT_NAME));
            }
            if name_to_id.insert(name.clone(), i).is_some() {
                return Err(anyhow::anyhow!("duplicate node name {}", name));
            }
        }

        let roots: Vec<usize> = (0..n).filter(|&i| parents[i].is_none()).collect();
        if roots.len() != 1 {
            return Err(anyhow::anyhow!("expected one root, found {}", roots.len()));
        }
        let root = roots[0];

        let mut nodes: Vec<TreeNode> = names
            .into_iter()
            .zip(branch_lengths)
            .zip(parents.iter())
            .map(|((name, branch_length), &parent)| TreeNode {
                cells: vec![],
                name,
                parent,
                children: vec![],
                branch_length,
            })
            .collect();

        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                if p >= n || p == i {
                    return Err(anyhow::anyhow!("invalid parent {} of node {}", p, i));
                }
                nodes[p].children.push(i);
            }
        }

        // every node must reach the root
        for i in 0..n {
            let mut u = i;
            let mut steps = 0;
            while let Some(p) = nodes[u].parent {
                u = p;
                steps += 1;
                if steps > n {
                    return Err(anyhow::anyhow!("cycle through node {}", nodes[i].name));
                }
            }
        }

        for node in nodes.iter_mut() {
            if node.children.is_empty() {
                node.cells = vec![node.name.clone()];
            }
        }

        let prior_root = nodes.len();
        nodes[root].parent = Some(prior_root);
        nodes.push(TreeNode {
            name: PRIOR_ROOT_NAME.into(),
            parent: None,
            children: vec![root],
            branch_length: None,
            cells: vec![],
        });
        name_to_id.insert(PRIOR_ROOT_NAME.into(), prior_root);

        Ok(Self {
            nodes,
            name_to_id,
            root,
            prior_root,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: usize) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.name_to_id.get(name).copied()
    }

    /// the biological root
    pub fn root(&self) -> usize {
        self.root
    }

    pub fn prior_root(&self) -> usize {
        self.prior_root
    }

    pub fn is_leaf(&self, id: usize) -> bool {
        id != self.prior_root && self.nodes[id].children.is_empty()
    }

    /// leaves in depth-first pre-order from the biological root
    pub fn leaves(&self) -> Vec<usize> {
        self.preorder()
            .into_iter()
            .filter(|&i| self.is_leaf(i))
            .collect()
    }

    pub fn leaf_names(&self) -> Vec<Box<str>> {
        self.leaves()
            .into_iter()
            .map(|i| self.nodes[i].name.clone())
            .collect()
    }

    /// depth-first pre-order of the biological tree
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(u) = stack.pop() {
            order.push(u);
            stack.extend(self.nodes[u].children.iter().rev());
        }
        order
    }

    /// Children first, then the parent. The prior root is a neighbour
    /// of the biological root only when `include_prior` is set.
    pub fn neighbours(&self, id: usize, include_prior: bool) -> impl Iterator<Item = usize> + '_ {
        let node = &self.nodes[id];
        let parent = node
            .parent
            .filter(|&p| include_prior || p != self.prior_root);
        node.children.iter().copied().chain(parent)
    }

    /// Length of the edge between `a` and `b`, which must be adjacent
    pub fn edge_length(&self, a: usize, b: usize, mode: EdgeLength) -> f64 {
        match mode {
            EdgeLength::Unit => 1.0,
            EdgeLength::Branch => {
                let child = if self.nodes[a].parent == Some(b) { a } else { b };
                match self.nodes[child].branch_length {
                    Some(l) if l.is_finite() => l.max(MIN_BRANCH_LENGTH),
                    _ => 1.0,
                }
            }
        }
    }

    /// number of edges between `id` and the biological root
    pub fn depth(&self, id: usize) -> usize {
        let mut d = 0;
        let mut u = id;
        while u != self.root {
            match self.nodes[u].parent {
                Some(p) if p != self.prior_root => {
                    u = p;
                    d += 1;
                }
                _ => break,
            }
        }
        d
    }

    /// all cells owned by leaves under `id`
    pub fn cells_below(&self, id: usize) -> Vec<Box<str>> {
        let mut out = vec![];
        let mut stack = vec![id];
        while let Some(u) = stack.pop() {
            if self.is_leaf(u) {
                out.extend(self.nodes[u].cells.iter().cloned());
            }
            stack.extend(self.nodes[u].children.iter().rev());
        }
        out
    }

    /// Cut the tree at `depth`: every node at that depth becomes a
    /// pseudo-leaf owning all cells below it, shallower leaves are kept
    /// as they are.
    pub fn collapse_at_depth(&self, depth: usize) -> anyhow::Result<PhyloTree> {
        let mut names = vec![];
        let mut parents = vec![];
        let mut lengths = vec![];
        let mut cells = vec![];
        let mut new_id: HashMap<usize, usize> = HashMap::new();

        let mut stack = vec![(self.root, 0_usize)];
        while let Some((u, d)) = stack.pop() {
            let node = &self.nodes[u];
            new_id.insert(u, names.len());
            names.push(node.name.clone());
            parents.push(
                node.parent
                    .filter(|&p| p != self.prior_root)
                    .and_then(|p| new_id.get(&p).copied()),
            );
            lengths.push(node.branch_length);
            if d == depth || self.is_leaf(u) {
                cells.push(self.cells_below(u));
            } else {
                cells.push(vec![]);
                stack.extend(node.children.iter().rev().map(|&c| (c, d + 1)));
            }
        }

        let mut ret = PhyloTree::from_parents(names, parents, lengths)?;
        for (i, c) in cells.into_iter().enumerate() {
            if ret.is_leaf(i) {
                ret.nodes[i].cells = c;
            }
        }
        Ok(ret)
    }

    /// Replace the cells owned by leaf `name`
    pub fn set_leaf_cells(&mut self, name: &str, cells: Vec<Box<str>>) -> anyhow::Result<()> {
        let id = self
            .id_of(name)
            .ok_or_else(|| anyhow::anyhow!("unknown node {}", name))?;
        if !self.is_leaf(id) {
            return Err(anyhow::anyhow!("{} is not a leaf", name));
        }
        self.nodes[id].cells = cells;
        Ok(())
    }
}
