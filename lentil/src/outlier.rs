//! Outlier cells in latent space.
//!
//! A minimum covariance determinant estimate of location and scatter is
//! found by concentration steps from random half-samples; cells whose
//! Mahalanobis distance falls in the top `contamination` fraction are
//! flagged as outliers.

use log::warn;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub type Mat = DMatrix<f64>;

pub trait InlierDetectorT {
    /// One flag per row of `x`; `true` marks an inlier
    fn fit_predict(&self, x: &Mat) -> anyhow::Result<Vec<bool>>;
}

/// Robust location and covariance
pub struct RobustCovariance {
    pub location: DVector<f64>,
    pub covariance: Mat,
    /// rows of the best half-sample
    pub support: Vec<usize>,
    chol: Cholesky<f64, Dyn>,
}

impl RobustCovariance {
    /// Fast-MCD without the subset-merging stage: `n_trials` random
    /// starts, each refined by at most `max_c_steps` concentration steps
    pub fn fit(x: &Mat, n_trials: usize, max_c_steps: usize, rng: &mut StdRng) -> anyhow::Result<Self> {
        let (n, p) = x.shape();
        if p == 0 || n <= p {
            return Err(anyhow::anyhow!(
                "need more samples than dimensions: {} x {}",
                n,
                p
            ));
        }
        let h = (n + p + 1) / 2;

        let mut best: Option<(f64, Self)> = None;
        let mut rows: Vec<usize> = (0..n).collect();

        for _ in 0..n_trials.max(1) {
            rows.shuffle(rng);
            let mut subset: Vec<usize> = rows[..h].to_vec();
            subset.sort_unstable();

            let mut fitted = None;
            for _ in 0..max_c_steps.max(1) {
                let Some(est) = Self::from_subset(x, &subset) else {
                    break;
                };
                let dist = est.mahalanobis(x);
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| dist[a].total_cmp(&dist[b]));
                let mut next = order[..h].to_vec();
                next.sort_unstable();

                let converged = next == subset;
                fitted = Some(est);
                if converged {
                    break;
                }
                subset = next;
            }

            if let Some(est) = fitted {
                let log_det = est.log_det();
                match &best {
                    Some((b, _)) if *b <= log_det => {}
                    _ => best = Some((log_det, est)),
                }
            }
        }

        best.map(|(_, est)| est)
            .ok_or_else(|| anyhow::anyhow!("singular covariance in every trial"))
    }

    /// MLE mean and covariance of `subset`, `None` if not positive definite
    fn from_subset(x: &Mat, subset: &[usize]) -> Option<Self> {
        let p = x.ncols();
        let m = subset.len() as f64;

        let mut location = DVector::<f64>::zeros(p);
        for &i in subset {
            location += x.row(i).transpose();
        }
        location /= m;

        let mut covariance = Mat::zeros(p, p);
        for &i in subset {
            let r = x.row(i).transpose() - &location;
            covariance += &r * r.transpose();
        }
        covariance /= m;

        let chol = covariance.clone().cholesky()?;
        let log_det: f64 = chol.l().diagonal().iter().map(|d| 2. * d.ln()).sum();
        if !log_det.is_finite() {
            return None;
        }

        Some(Self {
            location,
            covariance,
            support: subset.to_vec(),
            chol,
        })
    }

    pub fn log_det(&self) -> f64 {
        self.chol.l().diagonal().iter().map(|d| 2. * d.ln()).sum()
    }

    /// squared Mahalanobis distance of every row
    pub fn mahalanobis(&self, x: &Mat) -> Vec<f64> {
        let mut centred = x.transpose();
        for mut col in centred.column_iter_mut() {
            col -= &self.location;
        }
        let solved = self.chol.solve(&centred);
        centred
            .column_iter()
            .zip(solved.column_iter())
            .map(|(a, b)| a.dot(&b))
            .collect()
    }
}

/// Gaussian envelope around the robust fit
#[derive(Clone, Debug)]
pub struct EllipticEnvelope {
    /// expected fraction of outliers
    pub contamination: f64,
    pub n_trials: usize,
    pub max_c_steps: usize,
    pub seed: u64,
}

impl Default for EllipticEnvelope {
    fn default() -> Self {
        Self {
            contamination: 0.1,
            n_trials: 10,
            max_c_steps: 30,
            seed: 0,
        }
    }
}

impl InlierDetectorT for EllipticEnvelope {
    fn fit_predict(&self, x: &Mat) -> anyhow::Result<Vec<bool>> {
        if !(0. ..0.5).contains(&self.contamination) {
            return Err(anyhow::anyhow!(
                "contamination {} outside [0, 0.5)",
                self.contamination
            ));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let robust = RobustCovariance::fit(x, self.n_trials, self.max_c_steps, &mut rng)?;
        let dist = robust.mahalanobis(x);
        let cutoff = quantile(&dist, 1. - self.contamination);
        Ok(dist.iter().map(|&d| d <= cutoff).collect())
    }
}

/// linear-interpolated quantile
fn quantile(xs: &[f64], q: f64) -> f64 {
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0., 1.) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Keep the inliers among `indices` given their latent means (one row
/// each). Falls back to every index when the detector fails or would
/// keep at most one cell.
pub fn filter_cells<D: InlierDetectorT>(
    indices: &[usize],
    qz_m: &Mat,
    detector: &D,
) -> anyhow::Result<Vec<usize>> {
    if qz_m.nrows() != indices.len() {
        return Err(anyhow::anyhow!(
            "{} latent means for {} cells",
            qz_m.nrows(),
            indices.len()
        ));
    }

    let mask = match detector.fit_predict(qz_m) {
        Ok(mask) => mask,
        Err(e) => {
            warn!("could not estimate a robust covariance ({}), using all cells", e);
            vec![true; indices.len()]
        }
    };

    let mask = if mask.iter().filter(|&&m| m).count() <= 1 {
        vec![true; indices.len()]
    } else {
        mask
    };

    if mask.len() != indices.len() {
        return Err(anyhow::anyhow!("inlier mask does not match indices: {:?}", mask));
    }

    Ok(indices
        .iter()
        .zip(mask)
        .filter_map(|(&i, keep)| keep.then_some(i))
        .collect())
}
