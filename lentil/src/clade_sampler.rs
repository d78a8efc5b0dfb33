use candle_util::candle_core::Device;
use candle_util::candle_data_loader::{DataLoader, InMemoryData, MinibatchData};
use log::warn;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use std::collections::HashMap;

use crate::phylo_tree::PhyloTree;

/// Data rows available to each tree leaf, in the order of `barcodes`.
///
/// A plain leaf owns exactly one cell; a collapsed clade owns every
/// cell below it and is represented by one of them per step.
pub struct CladeSampler {
    groups: Vec<Vec<usize>>,
    rng: StdRng,
}

impl CladeSampler {
    /// * `tree` - leaves carry the cells they stand for
    /// * `barcodes` - leaf names in the row order the prior expects
    /// * `cell_names` - one name per data row
    pub fn new(
        tree: &PhyloTree,
        barcodes: &[Box<str>],
        cell_names: &[Box<str>],
        seed: u64,
    ) -> anyhow::Result<Self> {
        let row_of: HashMap<&str, usize> = cell_names
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_ref(), i))
            .collect();

        let mut groups = Vec::with_capacity(barcodes.len());
        let mut missing = 0_usize;

        for leaf in barcodes {
            let id = tree
                .id_of(leaf)
                .ok_or_else(|| anyhow::anyhow!("unknown leaf {}", leaf))?;
            let cells = &tree.node(id).cells;
            let rows: Vec<usize> = cells
                .iter()
                .filter_map(|c| row_of.get(c.as_ref()).copied())
                .collect();
            missing += cells.len() - rows.len();
            if rows.is_empty() {
                return Err(anyhow::anyhow!("no data for leaf {}", leaf));
            }
            groups.push(rows);
        }

        if missing > 0 {
            warn!("{} cells in the tree have no data row", missing);
        }

        Ok(Self {
            groups,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn num_leaves(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// one data row per leaf
    pub fn sample_rows(&mut self) -> Vec<usize> {
        let rng = &mut self.rng;
        self.groups
            .iter()
            .filter_map(|g| g.choose(rng).copied())
            .collect()
    }
}

/// Feeds whole-tree minibatches: every minibatch carries one cell per
/// leaf, so the structural prior always sees complete evidence.
pub struct CladeDataLoader<'a> {
    data: &'a InMemoryData,
    sampler: CladeSampler,
    steps_per_epoch: usize,
    draws: Vec<Vec<usize>>,
}

impl<'a> CladeDataLoader<'a> {
    pub fn new(data: &'a InMemoryData, sampler: CladeSampler, steps_per_epoch: usize) -> Self {
        Self {
            data,
            sampler,
            steps_per_epoch: steps_per_epoch.max(1),
            draws: vec![],
        }
    }

    pub fn sampler(&self) -> &CladeSampler {
        &self.sampler
    }
}

impl DataLoader for CladeDataLoader<'_> {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<MinibatchData> {
        let rows = self
            .draws
            .get(batch_idx)
            .ok_or_else(|| anyhow::anyhow!("minibatch {} not drawn", batch_idx))?;
        self.data.take_rows(rows, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.draws.len()
    }

    /// Redraw `steps_per_epoch` minibatches; the size is fixed by the
    /// number of leaves
    fn shuffle_minibatch(&mut self, _batch_size: usize) -> anyhow::Result<()> {
        self.draws = (0..self.steps_per_epoch)
            .map(|_| self.sampler.sample_rows())
            .collect();
        Ok(())
    }
}
