use std::collections::VecDeque;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 128,
            num_epochs: 400,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }
}

/// Summary statistics of one forward pass
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForwardRecord {
    /// mean per-cell `-log p(x|z) + log q(z|x)`
    pub reconstruction_loss: f32,
    /// structural log-likelihood divided by the number of cells
    pub structural_llik_per_cell: f32,
    /// mean of `log q(z|x)`
    pub log_qz: f32,
}

/// A bounded history of forward passes; the oldest record is dropped
/// once `capacity` is reached.
pub struct TrainingDiagnostics {
    capacity: usize,
    records: VecDeque<ForwardRecord>,
}

impl TrainingDiagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, rec: ForwardRecord) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(rec);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&ForwardRecord> {
        self.records.back()
    }

    /// oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ForwardRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for TrainingDiagnostics {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(x: f32) -> ForwardRecord {
        ForwardRecord {
            reconstruction_loss: x,
            structural_llik_per_cell: -x,
            log_qz: 0.,
        }
    }

    #[test]
    fn ring_buffer_keeps_latest() {
        let mut diag = TrainingDiagnostics::new(3);
        for i in 0..5 {
            diag.record(rec(i as f32));
        }
        assert_eq!(diag.len(), 3);
        let kept: Vec<f32> = diag.iter().map(|r| r.reconstruction_loss).collect();
        assert_eq!(kept, vec![2., 3., 4.]);
        assert_eq!(diag.last().map(|r| r.structural_llik_per_cell), Some(-4.));
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut diag = TrainingDiagnostics::new(0);
        diag.record(rec(1.));
        assert!(diag.is_empty());
    }
}
