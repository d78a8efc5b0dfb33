//! Bayesian differential expression between two cell groups.
//!
//! Expression profiles of each group are drawn from the model (either
//! importance-weighted population samples or plug-in posterior draws),
//! randomly paired across groups, and summarised gene by gene.

use crate::population::{get_normalized_expression, get_population_expression, PopulationConfig};

use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_data_loader::InMemoryData;
use candle_util::candle_data_loader_util::index_tensor;
use candle_util::candle_model_traits::GenerativeModelT;
use log::info;
use matrix_util::common_io::write_lines;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

const BAYES_FACTOR_EPS: f64 = 1e-8;

/// scale applied to library-normalised raw counts
const RAW_NORMALIZATION_SCALE: f64 = 1e4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeMode {
    /// `P(h1 > h2)`
    Vanilla,
    /// `P(|log2 h1 - log2 h2| >= delta)`
    Change,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpressionSampler {
    ImportanceSampling,
    PlugIn,
}

#[derive(Clone, Debug)]
pub struct DeConfig {
    pub mode: DeMode,
    pub sampler: ExpressionSampler,
    /// minimum absolute log fold change of interest
    pub delta: f64,
    pub pseudocounts: f64,
    pub fdr_target: f64,
    /// random cross-group pairs
    pub m_permutation: usize,
    /// plug-in profiles per group
    pub n_samples: usize,
    pub seed: u64,
    pub population: PopulationConfig,
}

impl Default for DeConfig {
    fn default() -> Self {
        Self {
            mode: DeMode::Change,
            sampler: ExpressionSampler::ImportanceSampling,
            delta: 0.25,
            pseudocounts: 0.,
            fdr_target: 0.05,
            m_permutation: 10_000,
            n_samples: 5_000,
            seed: 0,
            population: PopulationConfig::default(),
        }
    }
}

/// Summary of the log2 fold change distribution
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LfcSummary {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Raw count statistics of both groups
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawProperties {
    pub raw_mean1: f64,
    pub raw_mean2: f64,
    pub non_zeros_proportion1: f64,
    pub non_zeros_proportion2: f64,
    pub raw_normalized_mean1: f64,
    pub raw_normalized_mean2: f64,
}

#[derive(Clone, Debug)]
pub struct GeneDe {
    pub gene: Box<str>,
    /// `proba_de` in change mode, `proba_m1` in vanilla mode
    pub proba: f64,
    pub bayes_factor: f64,
    pub scale1: f64,
    pub scale2: f64,
    /// change mode only
    pub lfc: Option<LfcSummary>,
    /// change mode only
    pub is_de_fdr: Option<bool>,
    pub raw: RawProperties,
}

/// Ordered per-gene results
pub struct DeTable {
    pub mode: DeMode,
    pub delta: f64,
    pub pseudocounts: f64,
    pub fdr_target: f64,
    pub genes: Vec<GeneDe>,
}

fn log_odds(p: f64) -> f64 {
    (p + BAYES_FACTOR_EPS).ln() - (1. - p + BAYES_FACTOR_EPS).ln()
}

/// Flag the leading genes, by descending `proba`, whose running mean of
/// `1 - proba` stays within `fdr_target`
pub fn fdr_de_prediction(proba: &[f64], fdr_target: f64) -> Vec<bool> {
    let mut order: Vec<usize> = (0..proba.len()).collect();
    order.sort_by(|&a, &b| proba[b].total_cmp(&proba[a]));

    let mut is_de = vec![false; proba.len()];
    let mut cum = 0.;
    for (rank, &g) in order.iter().enumerate() {
        cum += 1. - proba[g];
        if cum / (rank + 1) as f64 > fdr_target {
            break;
        }
        is_de[g] = true;
    }
    is_de
}

fn describe(mut xs: Vec<f64>) -> LfcSummary {
    let n = xs.len().max(1) as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    xs.sort_by(|a, b| a.total_cmp(b));
    let median = match xs.len() {
        0 => f64::NAN,
        m if m % 2 == 1 => xs[m / 2],
        m => 0.5 * (xs[m / 2 - 1] + xs[m / 2]),
    };
    LfcSummary {
        mean,
        median,
        std: var.sqrt(),
        min: xs.first().copied().unwrap_or(f64::NAN),
        max: xs.last().copied().unwrap_or(f64::NAN),
    }
}

fn column_means(rows: &[Vec<f32>], n_genes: usize) -> Vec<f64> {
    let mut out = vec![0.; n_genes];
    for r in rows {
        for (o, &x) in out.iter_mut().zip(r.iter()) {
            *o += x as f64;
        }
    }
    let n = rows.len().max(1) as f64;
    out.iter_mut().for_each(|o| *o /= n);
    out
}

/// Per-gene statistics from two sets of expression profiles (S x G)
pub fn bayes_factors(
    h1: &Tensor,
    h2: &Tensor,
    config: &DeConfig,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<(f64, f64, f64, f64, Option<LfcSummary>)>> {
    let (s1, g1) = h1.dims2()?;
    let (s2, g2) = h2.dims2()?;
    if g1 != g2 {
        return Err(anyhow::anyhow!("{} vs. {} genes", g1, g2));
    }
    if s1 == 0 || s2 == 0 {
        return Err(anyhow::anyhow!("no expression samples: {} and {}", s1, s2));
    }

    let h1: Vec<Vec<f32>> = h1.to_dtype(DType::F32)?.to_vec2()?;
    let h2: Vec<Vec<f32>> = h2.to_dtype(DType::F32)?.to_vec2()?;
    let scale1 = column_means(&h1, g1);
    let scale2 = column_means(&h2, g1);

    let m = config.m_permutation.max(1);
    let pairs: Vec<(usize, usize)> = (0..m)
        .map(|_| (rng.random_range(0..s1), rng.random_range(0..s2)))
        .collect();

    let pc = config.pseudocounts;
    let delta = config.delta;
    let mode = config.mode;

    Ok((0..g1)
        .into_par_iter()
        .map(|g| match mode {
            DeMode::Change => {
                let lfc: Vec<f64> = pairs
                    .iter()
                    .map(|&(i, j)| (h1[i][g] as f64 + pc).log2() - (h2[j][g] as f64 + pc).log2())
                    .collect();
                let p = lfc.iter().filter(|x| x.abs() >= delta).count() as f64 / m as f64;
                (p, log_odds(p), scale1[g], scale2[g], Some(describe(lfc)))
            }
            DeMode::Vanilla => {
                let p = pairs.iter().filter(|&&(i, j)| h1[i][g] > h2[j][g]).count() as f64 / m as f64;
                (p, log_odds(p), scale1[g], scale2[g], None)
            }
        })
        .collect())
}

/// Raw means, non-zero proportions and library-normalised means
pub fn raw_counts_properties(
    data: &InMemoryData,
    idx1: &[usize],
    idx2: &[usize],
) -> anyhow::Result<Vec<RawProperties>> {
    let stats = |idx: &[usize]| -> anyhow::Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let x = data
            .counts()
            .index_select(&index_tensor(idx, &Device::Cpu)?, 0)?
            .to_dtype(DType::F64)?;
        let n = idx.len().max(1) as f64;
        let mean = (x.sum(0)? / n)?.to_vec1::<f64>()?;
        let nonzero = (x.ne(0.)?.to_dtype(DType::F64)?.sum(0)? / n)?.to_vec1::<f64>()?;
        let library = x.sum_keepdim(1)?.clamp(1., f64::MAX)?;
        let normalized = ((x.broadcast_div(&library)? * RAW_NORMALIZATION_SCALE)?.sum(0)? / n)?
            .to_vec1::<f64>()?;
        Ok((mean, nonzero, normalized))
    };

    let (mean1, nz1, norm1) = stats(idx1)?;
    let (mean2, nz2, norm2) = stats(idx2)?;

    Ok((0..mean1.len())
        .map(|g| RawProperties {
            raw_mean1: mean1[g],
            raw_mean2: mean2[g],
            non_zeros_proportion1: nz1[g],
            non_zeros_proportion2: nz2[g],
            raw_normalized_mean1: norm1[g],
            raw_normalized_mean2: norm2[g],
        })
        .collect())
}

/// Expression profiles of one group under the configured sampler
pub fn sample_group_expression<M>(
    model: &M,
    data: &InMemoryData,
    idx: &[usize],
    config: &DeConfig,
    device: &Device,
) -> anyhow::Result<Tensor>
where
    M: GenerativeModelT + Sync,
{
    match config.sampler {
        ExpressionSampler::ImportanceSampling => {
            get_population_expression(model, data, idx, &config.population, device)
        }
        ExpressionSampler::PlugIn => {
            get_normalized_expression(model, data, idx, config.n_samples, &config.population, device)
        }
    }
}

/// Compare cells `idx1` against cells `idx2`
pub fn differential_expression<M>(
    model: &M,
    data: &InMemoryData,
    gene_names: &[Box<str>],
    idx1: &[usize],
    idx2: &[usize],
    config: &DeConfig,
    device: &Device,
) -> anyhow::Result<DeTable>
where
    M: GenerativeModelT + Sync,
{
    if gene_names.len() != data.num_features() || model.dim_obs() != data.num_features() {
        return Err(anyhow::anyhow!(
            "{} gene names, {} features in data, {} in the model",
            gene_names.len(),
            data.num_features(),
            model.dim_obs()
        ));
    }
    if idx1.is_empty() || idx2.is_empty() {
        return Err(anyhow::anyhow!("empty group: {} vs. {} cells", idx1.len(), idx2.len()));
    }

    let h1 = sample_group_expression(model, data, idx1, config, device)?;
    let h2 = sample_group_expression(model, data, idx2, config, device)?;
    info!("{} and {} expression samples", h1.dim(0)?, h2.dim(0)?);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let stats = bayes_factors(&h1, &h2, config, &mut rng)?;
    let raw = raw_counts_properties(data, idx1, idx2)?;

    let is_de_fdr = match config.mode {
        DeMode::Change => {
            let proba: Vec<f64> = stats.iter().map(|s| s.0).collect();
            Some(fdr_de_prediction(&proba, config.fdr_target))
        }
        DeMode::Vanilla => None,
    };

    let mut genes: Vec<GeneDe> = stats
        .into_iter()
        .zip(raw)
        .enumerate()
        .map(|(g, ((proba, bayes_factor, scale1, scale2, lfc), raw))| GeneDe {
            gene: gene_names[g].clone(),
            proba,
            bayes_factor,
            scale1,
            scale2,
            lfc,
            is_de_fdr: is_de_fdr.as_ref().map(|v| v[g]),
            raw,
        })
        .collect();

    match config.mode {
        DeMode::Change => genes.sort_by(|a, b| b.proba.total_cmp(&a.proba)),
        DeMode::Vanilla => genes.sort_by(|a, b| b.bayes_factor.total_cmp(&a.bayes_factor)),
    }

    Ok(DeTable {
        mode: config.mode,
        delta: config.delta,
        pseudocounts: config.pseudocounts,
        fdr_target: config.fdr_target,
        genes,
    })
}

impl DeTable {
    pub fn header(&self) -> Box<str> {
        let raw = "raw_mean1\traw_mean2\tnon_zeros_proportion1\tnon_zeros_proportion2\traw_normalized_mean1\traw_normalized_mean2";
        match self.mode {
            DeMode::Change => format!(
                "gene\tproba_de\tproba_not_de\tbayes_factor\tscale1\tscale2\tpseudocounts\tdelta\t\
                 lfc_mean\tlfc_median\tlfc_std\tlfc_min\tlfc_max\tis_de_fdr_{}\t{}",
                self.fdr_target, raw
            ),
            DeMode::Vanilla => format!(
                "gene\tproba_m1\tproba_m2\tbayes_factor\tscale1\tscale2\t{}",
                raw
            ),
        }
        .into_boxed_str()
    }

    pub fn to_lines(&self) -> Vec<Box<str>> {
        let mut lines = vec![self.header()];
        for g in self.genes.iter() {
            let r = &g.raw;
            let raw = format!(
                "{}\t{}\t{}\t{}\t{}\t{}",
                r.raw_mean1,
                r.raw_mean2,
                r.non_zeros_proportion1,
                r.non_zeros_proportion2,
                r.raw_normalized_mean1,
                r.raw_normalized_mean2
            );
            let line = match (self.mode, g.lfc) {
                (DeMode::Change, Some(lfc)) => format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    g.gene,
                    g.proba,
                    1. - g.proba,
                    g.bayes_factor,
                    g.scale1,
                    g.scale2,
                    self.pseudocounts,
                    self.delta,
                    lfc.mean,
                    lfc.median,
                    lfc.std,
                    lfc.min,
                    lfc.max,
                    g.is_de_fdr.unwrap_or(false),
                    raw
                ),
                _ => format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    g.gene,
                    g.proba,
                    1. - g.proba,
                    g.bayes_factor,
                    g.scale1,
                    g.scale2,
                    raw
                ),
            };
            lines.push(line.into_boxed_str());
        }
        lines
    }

    pub fn to_tsv(&self, file: &str) -> anyhow::Result<()> {
        write_lines(&self.to_lines(), file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{toy_data, ToyModel};

    #[test]
    fn fdr_flags_a_leading_prefix() {
        let proba = [0.5, 0.99, 0.97, 0.2, 0.9];
        let flags = fdr_de_prediction(&proba, 0.05);
        // sorted: .99 .97 .9 → running mean of 1-p: .01 .02 .0467 then .16
        assert_eq!(flags, vec![false, true, true, false, true]);
        assert!(fdr_de_prediction(&proba, 0.).iter().all(|&f| !f));
    }

    #[test]
    fn lfc_summary() {
        let s = describe(vec![3., -1., 1., 5.]);
        approx::assert_abs_diff_eq!(s.mean, 2.);
        approx::assert_abs_diff_eq!(s.median, 2.);
        approx::assert_abs_diff_eq!(s.min, -1.);
        approx::assert_abs_diff_eq!(s.max, 5.);
        approx::assert_abs_diff_eq!(s.std, 5_f64.sqrt());
    }

    #[test]
    fn separated_groups_are_detected() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let h1 = Tensor::new(&[[0.7_f32, 0.2, 0.1], [0.72, 0.18, 0.1]], &dev)?;
        let h2 = Tensor::new(&[[0.2_f32, 0.7, 0.1], [0.22, 0.68, 0.1]], &dev)?;
        let mut rng = StdRng::seed_from_u64(0);

        let change = bayes_factors(&h1, &h2, &DeConfig::default(), &mut rng)?;
        assert_eq!(change[0].0, 1.);
        assert_eq!(change[1].0, 1.);
        assert_eq!(change[2].0, 0.);
        assert!(change[0].1 > 10.);
        let lfc = change[0].4.ok_or(anyhow::anyhow!("lfc"))?;
        assert!(lfc.min > 1.);

        let vanilla = DeConfig {
            mode: DeMode::Vanilla,
            ..DeConfig::default()
        };
        let v = bayes_factors(&h1, &h2, &vanilla, &mut rng)?;
        assert_eq!(v[0].0, 1.);
        assert_eq!(v[1].0, 0.);
        assert!(v[1].1 < -10.);
        assert!(v[0].4.is_none());
        Ok(())
    }

    #[test]
    fn raw_properties() -> anyhow::Result<()> {
        let data = toy_data(&Device::Cpu)?;
        let raw = raw_counts_properties(&data, &[0, 2], &[1])?;
        assert_eq!(raw.len(), 4);
        // rows 0 and 2: [8,1,3,0] and [10,1,3,0]
        approx::assert_abs_diff_eq!(raw[0].raw_mean1, 9.);
        approx::assert_abs_diff_eq!(raw[3].non_zeros_proportion1, 0.);
        approx::assert_abs_diff_eq!(raw[3].non_zeros_proportion2, 1.);
        let total: f64 = raw.iter().map(|r| r.raw_normalized_mean1).sum();
        approx::assert_abs_diff_eq!(total, 1e4, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn end_to_end_table() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let model = ToyModel::new(&dev)?;
        let data = toy_data(&dev)?;
        let genes: Vec<Box<str>> = ["g0", "g1", "g2", "g3"].iter().map(|&s| s.into()).collect();
        let even: Vec<usize> = (0..24).step_by(2).collect();
        let odd: Vec<usize> = (1..24).step_by(2).collect();

        let config = DeConfig {
            m_permutation: 500,
            population: PopulationConfig {
                n_samples: 3,
                n_mc_samples: 30,
                marginal_n_samples_per_pass: 10,
                batch_size: 8,
                ..PopulationConfig::default()
            },
            ..DeConfig::default()
        };
        let table = differential_expression(&model, &data, &genes, &even, &odd, &config, &dev)?;
        assert_eq!(table.genes.len(), 4);
        for w in table.genes.windows(2) {
            assert!(w[0].proba >= w[1].proba);
        }
        assert!(table.genes.iter().all(|g| g.is_de_fdr.is_some() && g.lfc.is_some()));

        let plug_in = DeConfig {
            sampler: ExpressionSampler::PlugIn,
            mode: DeMode::Vanilla,
            n_samples: 40,
            ..config
        };
        let table = differential_expression(&model, &data, &genes, &even, &odd, &plug_in, &dev)?;
        for w in table.genes.windows(2) {
            assert!(w[0].bayes_factor >= w[1].bayes_factor);
        }

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("de.tsv");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;
        table.to_tsv(file)?;
        let lines = matrix_util::common_io::read_lines(file)?;
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("gene\tproba_m1"));
        Ok(())
    }

    #[test]
    fn mismatched_gene_names_are_an_error() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let model = ToyModel::new(&dev)?;
        let data = toy_data(&dev)?;
        let genes: Vec<Box<str>> = vec!["g0".into()];
        let res = differential_expression(&model, &data, &genes, &[0], &[1], &DeConfig::default(), &dev);
        assert!(res.is_err());
        Ok(())
    }
}
