use crate::candle_data_loader_util::*;
use candle_core::{DType, Device, Tensor};

pub struct MinibatchData {
    /// counts (n x d)
    pub input: Tensor,
    /// one-hot batch membership (n x batches)
    pub batch: Option<Tensor>,
    /// one-hot label membership (n x labels)
    pub label: Option<Tensor>,
    /// which rows of the full data these are
    pub rows: Vec<usize>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

/// A categorical covariate stored as dense codes `0..depth`
#[derive(Clone, Debug)]
pub struct CategoricalCodes {
    pub codes: Vec<usize>,
    pub depth: usize,
}

impl CategoricalCodes {
    pub fn new(codes: Vec<usize>) -> Self {
        let depth = codes.iter().max().map(|&m| m + 1).unwrap_or(0);
        Self { codes, depth }
    }
}

///
/// A simple data loader for an in-memory count matrix. Each row is
/// one cell; columns are genes.
///
pub struct InMemoryData {
    counts: Tensor,
    batch: Option<CategoricalCodes>,
    label: Option<CategoricalCodes>,
    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main count matrix (cells x genes)
    ///
    pub fn new(counts: &Tensor) -> anyhow::Result<Self> {
        let (nrows, _) = counts.dims2()?;
        Ok(InMemoryData {
            counts: counts.to_device(&Device::Cpu)?.to_dtype(DType::F32)?,
            batch: None,
            label: None,
            minibatches: Minibatches::new(nrows),
        })
    }

    /// Attach per-cell batch codes
    pub fn with_batch(mut self, batch: CategoricalCodes) -> anyhow::Result<Self> {
        self.check_codes(&batch, "batch")?;
        self.batch = Some(batch);
        Ok(self)
    }

    /// Attach per-cell label codes
    pub fn with_label(mut self, label: CategoricalCodes) -> anyhow::Result<Self> {
        self.check_codes(&label, "label")?;
        self.label = Some(label);
        Ok(self)
    }

    fn check_codes(&self, codes: &CategoricalCodes, what: &str) -> anyhow::Result<()> {
        if codes.codes.len() != self.num_rows() {
            return Err(anyhow::anyhow!(
                "{} codes: {} vs. {} cells",
                what,
                codes.codes.len(),
                self.num_rows()
            ));
        }
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.counts.dim(0).unwrap_or(0)
    }

    pub fn num_features(&self) -> usize {
        self.counts.dim(1).unwrap_or(0)
    }

    pub fn counts(&self) -> &Tensor {
        &self.counts
    }

    pub fn batch(&self) -> Option<&CategoricalCodes> {
        self.batch.as_ref()
    }

    pub fn label(&self) -> Option<&CategoricalCodes> {
        self.label.as_ref()
    }

    /// Gather `rows` into a minibatch
    pub fn take_rows(&self, rows: &[usize], target_device: &Device) -> anyhow::Result<MinibatchData> {
        self.take_rows_in_batch(rows, None, target_device)
    }

    /// Gather `rows`; if `transform_batch` is given every row is
    /// treated as a member of that batch
    pub fn take_rows_in_batch(
        &self,
        rows: &[usize],
        transform_batch: Option<usize>,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let ntot = self.num_rows();
        if let Some(&bad) = rows.iter().find(|&&r| r >= ntot) {
            return Err(anyhow::anyhow!("row {} out of range {}", bad, ntot));
        }

        let input = self
            .counts
            .index_select(&index_tensor(rows, &Device::Cpu)?, 0)?
            .to_device(target_device)?;

        let batch = match &self.batch {
            Some(b) => {
                let codes: Vec<usize> = match transform_batch {
                    Some(t) => vec![t; rows.len()],
                    None => rows.iter().map(|&r| b.codes[r]).collect(),
                };
                Some(one_hot_codes(&codes, b.depth, target_device)?)
            }
            None => None,
        };

        let label = match &self.label {
            Some(l) => {
                let codes: Vec<usize> = rows.iter().map(|&r| l.codes[r]).collect();
                Some(one_hot_codes(&codes, l.depth, target_device)?)
            }
            None => None,
        };

        Ok(MinibatchData {
            input,
            batch,
            label,
            rows: rows.to_vec(),
        })
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let rows = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.minibatches.chunks.len()
            )
        })?;
        self.take_rows(rows, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_rows_with_batch_override() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1_f32, 2.], [3., 4.], [5., 6.]], &dev)?;
        let data = InMemoryData::new(&x)?.with_batch(CategoricalCodes::new(vec![0, 1, 1]))?;

        let mb = data.take_rows(&[2, 0], &dev)?;
        assert_eq!(mb.input.to_vec2::<f32>()?, vec![vec![5., 6.], vec![1., 2.]]);
        let batch = mb.batch.unwrap().to_vec2::<f32>()?;
        assert_eq!(batch, vec![vec![0., 1.], vec![1., 0.]]);

        let mb = data.take_rows_in_batch(&[2, 0], Some(0), &dev)?;
        let batch = mb.batch.unwrap().to_vec2::<f32>()?;
        assert_eq!(batch, vec![vec![1., 0.], vec![1., 0.]]);

        assert!(data.take_rows(&[3], &dev).is_err());
        assert!(InMemoryData::new(&x)?
            .with_batch(CategoricalCodes::new(vec![0]))
            .is_err());
        Ok(())
    }
}
