use rand::prelude::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., cluster assignment)
/// * `nelem_per_group` - number of elements per group (if None, no downsampling)
/// * `rng` - random number generator used for downsampling
/// # Returns
/// A hashmap: group name -> indexes of the elements
pub fn partition_by_membership<T, R>(
    membership: &[T],
    nelem_per_group: Option<usize>,
    rng: &mut R,
) -> HashMap<T, Vec<usize>>
where
    T: Eq + Hash + Clone,
    R: Rng + ?Sized,
{
    let mut groups: HashMap<T, Vec<usize>> = HashMap::default();
    for (cell, k) in membership.iter().enumerate() {
        groups.entry(k.clone()).or_default().push(cell);
    }

    if let Some(ntarget) = nelem_per_group {
        for cells in groups.values_mut() {
            if cells.len() > ntarget {
                cells.shuffle(rng);
                cells.truncate(ntarget);
                cells.sort_unstable();
            }
        }
    }
    groups
}

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Split `ntot` elements into `nparts` contiguous intervals whose
/// sizes differ by at most one; the first `ntot % nparts` intervals
/// take the extra element.
pub fn split_even_intervals(ntot: usize, nparts: usize) -> Vec<(usize, usize)> {
    if nparts == 0 {
        return vec![];
    }
    let base = ntot / nparts;
    let extra = ntot % nparts;
    let mut lb = 0;
    (0..nparts)
        .map(|k| {
            let ub = lb + base + usize::from(k < extra);
            let out = (lb, ub);
            lb = ub;
            out
        })
        .collect()
}
