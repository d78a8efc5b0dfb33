use candle_core::{Device, Tensor};
use rand::prelude::SliceRandom;

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition `samples`.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(ntot: usize) -> Self {
        Self {
            samples: (0..ntot).collect(),
            chunks: vec![],
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// row indexes as a `u32` tensor for `index_select`
pub fn index_tensor(rows: &[usize], device: &Device) -> candle_core::Result<Tensor> {
    let ids = rows.iter().map(|&i| i as u32).collect::<Vec<_>>();
    Tensor::from_vec(ids, rows.len(), device)
}

/// one-hot encode categorical codes into an (n x depth) `f32` matrix
pub fn one_hot_codes(codes: &[usize], depth: usize, device: &Device) -> candle_core::Result<Tensor> {
    if let Some(&bad) = codes.iter().find(|&&c| c >= depth) {
        candle_core::bail!("category code {} out of range {}", bad, depth);
    }
    candle_nn::encoding::one_hot(index_tensor(codes, device)?, depth, 1_f32, 0_f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minibatches_partition_samples() {
        let mut mb = Minibatches::new(10);
        mb.shuffle_minibatch(4);
        assert_eq!(mb.chunks.len(), 3);
        let mut seen = mb.chunks.concat();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn one_hot_rows() -> candle_core::Result<()> {
        let x = one_hot_codes(&[2, 0], 3, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(x, vec![vec![0., 0., 1.], vec![1., 0., 0.]]);
        assert!(one_hot_codes(&[3], 3, &Device::Cpu).is_err());
        Ok(())
    }
}
