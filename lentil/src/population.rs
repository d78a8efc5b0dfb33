//! Importance-sampled expression of a cell population.
//!
//! Posterior draws of every cell in a chunk are pooled and reweighted
//! against the population marginal
//!
//!   w_m ∝ Σ_j p(z_m) p(x_j | z_m) / ( p(x_j) Σ_j' q(z_m | x_j') )
//!
//! so that resampled expression profiles follow the population rather
//! than the per-cell amortised posteriors. All weights stay in log space
//! until the final categorical draw.

use crate::outlier::{filter_cells, EllipticEnvelope, Mat};

use candle_util::candle_core::{DType, Device, Result, Shape, Tensor};
use candle_util::candle_data_loader::{InMemoryData, MinibatchData};
use candle_util::candle_data_loader_util::index_tensor;
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::*;
use candle_util::candle_vae_inference::log_library_size;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressDrawTarget};
use log::{debug, info};
use matrix_util::utils::{generate_minibatch_intervals, split_even_intervals};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{weighted::WeightedIndex, Distribution, StandardNormal};
use rayon::prelude::*;

#[derive(Clone, Debug)]
pub struct PopulationConfig {
    /// posterior draws per cell when `n_samples_overall` is not given
    pub n_samples: usize,
    /// total number of expression profiles to return
    pub n_samples_overall: Option<usize>,
    /// cells per forward pass
    pub batch_size: usize,
    /// drop latent-space outliers before sampling
    pub filter_cells: bool,
    /// only use cells of this batch, decoded as members of it
    pub transform_batch: Option<usize>,
    pub marginal_n_samples_per_pass: usize,
    /// Monte Carlo draws per cell for `log p(x)`
    pub n_mc_samples: usize,
    pub n_cells_per_chunk: usize,
    pub max_chunks: Option<usize>,
    pub max_samples_per_cell: usize,
    pub seed: u64,
    pub parallel_chunks: bool,
    pub show_progress: bool,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            n_samples: 25,
            n_samples_overall: None,
            batch_size: 64,
            filter_cells: true,
            transform_batch: None,
            marginal_n_samples_per_pass: 500,
            n_mc_samples: 5000,
            n_cells_per_chunk: 500,
            max_chunks: None,
            max_samples_per_cell: 100,
            seed: 0,
            parallel_chunks: false,
            show_progress: false,
        }
    }
}

/// Everything drawn and scored for one chunk of cells
pub struct ChunkSamples {
    /// pooled latent draws (M x k)
    pub zs: Tensor,
    /// (n x k)
    pub qz_m: Tensor,
    /// (n x k)
    pub qz_v: Tensor,
    /// decoded `px_scale` of every draw (M x G)
    pub hs: Tensor,
    /// log p(x_j | z_m) (M x n)
    pub log_px_zs: Tensor,
    /// log q(z_m | x_j) (M x n)
    pub log_qz: Tensor,
    /// log N(z_m; 0, I) (M)
    pub log_pz: Tensor,
    /// normalised log importance weights (M)
    pub log_probs: Tensor,
    /// `hs` resampled by weight (M x G)
    pub hs_weighted: Tensor,
}

/// Shuffle `indices` and cut them into `ceil(N / n_cells_per_chunk)`
/// chunks whose sizes differ by at most one; keep at most `max_chunks`.
pub fn split_into_chunks(
    indices: &[usize],
    n_cells_per_chunk: usize,
    max_chunks: Option<usize>,
    rng: &mut StdRng,
) -> Vec<Vec<usize>> {
    let mut shuffled = indices.to_vec();
    shuffled.shuffle(rng);
    let n_chunks = shuffled.len().div_ceil(n_cells_per_chunk.max(1));
    let mut chunks: Vec<Vec<usize>> = split_even_intervals(shuffled.len(), n_chunks)
        .into_iter()
        .map(|(lb, ub)| shuffled[lb..ub].to_vec())
        .collect();
    if let Some(m) = max_chunks {
        chunks.truncate(m);
    }
    chunks
}

/// Normalised log importance weights of pooled draws
///
/// * `log_pz_m` - prior density of each draw (M)
/// * `log_px_zs_mn` - every draw against every cell (M x n)
/// * `log_px_n` - marginal likelihood of each cell (n)
/// * `log_qz_mn` - every draw under every cell's posterior (M x n)
pub fn importance_log_probs(
    log_pz_m: &Tensor,
    log_px_zs_mn: &Tensor,
    log_px_n: &Tensor,
    log_qz_mn: &Tensor,
) -> Result<Tensor> {
    let log_mixture = log_qz_mn.log_sum_exp(1)?.unsqueeze(1)?;
    let iw = log_px_zs_mn
        .broadcast_add(&log_pz_m.unsqueeze(1)?)?
        .broadcast_sub(&log_px_n.unsqueeze(0)?)?
        .broadcast_sub(&log_mixture)?
        .log_sum_exp(1)?;
    let log_norm = iw.log_sum_exp(0)?;
    iw.broadcast_sub(&log_norm)
}

/// `n` categorical draws from `exp(log_probs)`
pub fn resample_indices(log_probs: &Tensor, n: usize, rng: &mut StdRng) -> anyhow::Result<Vec<usize>> {
    let probs: Vec<f64> = log_probs.to_dtype(DType::F64)?.exp()?.to_vec1()?;
    let dist = WeightedIndex::new(&probs)?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

/// standard normal noise drawn from `rng` on the host
pub(crate) fn randn<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let eps: Vec<f32> = (0..shape.elem_count()).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(eps, shape, device)?.to_dtype(dtype)
}

/// `n` draws per row of `q(z|x)`, shaped (n x rows x k)
fn sample_posterior(qz_m: &Tensor, qz_v: &Tensor, n: usize, rng: &mut StdRng) -> Result<Tensor> {
    let (b, k) = qz_m.dims2()?;
    let eps = randn(rng, (n, b, k), qz_m.dtype(), qz_m.device())?;
    qz_m.unsqueeze(0)?
        .broadcast_add(&qz_v.sqrt()?.unsqueeze(0)?.broadcast_mul(&eps)?)
}

/// Decode `z_rk` where row `r` is paired with cell `r % b` of `mb`
fn decode_tiled<M: GenerativeModelT>(
    model: &M,
    z_rk: &Tensor,
    mb: &MinibatchData,
    library_b1: &Tensor,
    times: usize,
) -> Result<ExpressionParams> {
    let library = library_b1.repeat((times, 1))?;
    let batch = mb.batch.as_ref().map(|t| t.repeat((times, 1))).transpose()?;
    let label = mb.label.as_ref().map(|t| t.repeat((times, 1))).transpose()?;
    let covar = Covariates {
        batch: batch.as_ref(),
        label: label.as_ref(),
    };
    model.decode(z_rk, &library, &covar)
}

fn tiled_log_likelihood<M: GenerativeModelT>(
    model: &M,
    z_rk: &Tensor,
    mb: &MinibatchData,
    library_b1: &Tensor,
    times: usize,
) -> Result<Tensor> {
    let params = decode_tiled(model, z_rk, mb, library_b1, times)?;
    model.log_likelihood(&mb.input.repeat((times, 1))?, &params)
}

fn minibatches(
    data: &InMemoryData,
    rows: &[usize],
    config: &PopulationConfig,
    device: &Device,
) -> anyhow::Result<Vec<MinibatchData>> {
    generate_minibatch_intervals(rows.len(), config.batch_size)
        .into_iter()
        .map(|(lb, ub)| data.take_rows_in_batch(&rows[lb..ub], config.transform_batch, device))
        .collect()
}

/// log-mean-exp of `p(x|z) p(z) / q(z|x)` over `n_mc` posterior draws
fn minibatch_marginal_log_likelihood<M: GenerativeModelT>(
    model: &M,
    mb: &MinibatchData,
    n_mc: usize,
    n_per_pass: usize,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let b = mb.input.dim(0)?;
    let library = log_library_size(&mb.input)?;
    let (qz_m, qz_v) = model.latent_posterior(&mb.input)?;

    let mut passes = vec![];
    let mut remaining = n_mc.max(1);
    while remaining > 0 {
        let s = remaining.min(n_per_pass.max(1));
        remaining -= s;

        let z = sample_posterior(&qz_m, &qz_v, s, rng)?;
        let log_qz = gaussian_log_density(&z, &qz_m, &qz_v)?;
        let log_pz = standard_normal_log_density(&z)?;
        let llik = tiled_log_likelihood(model, &z.flatten_to(1)?, mb, &library, s)?.reshape((s, b))?;
        passes.push(((llik + log_pz)? - log_qz)?);
    }
    log_mean_exp(&Tensor::cat(&passes, 0)?, 0)
}

/// Importance-sampled `log p(x)` of each cell in `rows`
pub fn marginal_log_likelihood<M: GenerativeModelT>(
    model: &M,
    data: &InMemoryData,
    rows: &[usize],
    config: &PopulationConfig,
    rng: &mut StdRng,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let mut out = vec![];
    for mb in minibatches(data, rows, config, device)? {
        out.push(minibatch_marginal_log_likelihood(
            model,
            &mb,
            config.n_mc_samples,
            config.marginal_n_samples_per_pass,
            rng,
        )?);
    }
    Ok(Tensor::cat(&out, 0)?)
}

/// Draw, score and resample the posterior samples of one chunk
pub fn sample_chunk<M: GenerativeModelT>(
    model: &M,
    data: &InMemoryData,
    chunk: &[usize],
    n_samples_per_cell: usize,
    config: &PopulationConfig,
    rng: &mut StdRng,
    device: &Device,
) -> anyhow::Result<ChunkSamples> {
    let mbs = minibatches(data, chunk, config, device)?;
    let libraries = mbs
        .iter()
        .map(|mb| log_library_size(&mb.input))
        .collect::<Result<Vec<_>>>()?;

    let (mut zs, mut hs, mut qz_ms, mut qz_vs) = (vec![], vec![], vec![], vec![]);
    for (mb, library) in mbs.iter().zip(libraries.iter()) {
        let (qz_m, qz_v) = model.latent_posterior(&mb.input)?;
        let z = sample_posterior(&qz_m, &qz_v, n_samples_per_cell, rng)?.flatten_to(1)?;
        let params = decode_tiled(model, &z, mb, library, n_samples_per_cell)?;
        zs.push(z);
        hs.push(params.px_scale);
        qz_ms.push(qz_m);
        qz_vs.push(qz_v);
    }
    let zs = Tensor::cat(&zs, 0)?;
    let hs = Tensor::cat(&hs, 0)?;
    let qz_m = Tensor::cat(&qz_ms, 0)?;
    let qz_v = Tensor::cat(&qz_vs, 0)?;
    let (m, k) = zs.dims2()?;

    // every pooled draw against every cell of the chunk
    let mut columns = vec![];
    for (mb, library) in mbs.iter().zip(libraries.iter()) {
        let b = mb.input.dim(0)?;
        let mut blocks = vec![];
        for (lb, ub) in generate_minibatch_intervals(m, config.batch_size) {
            let mz = ub - lb;
            let z = zs
                .narrow(0, lb, mz)?
                .unsqueeze(1)?
                .broadcast_as((mz, b, k))?
                .contiguous()?
                .reshape((mz * b, k))?;
            blocks.push(tiled_log_likelihood(model, &z, mb, library, mz)?.reshape((mz, b))?);
        }
        columns.push(Tensor::cat(&blocks, 0)?);
    }
    let log_px_zs = Tensor::cat(&columns, 1)?;

    let log_qz = gaussian_log_density(&zs.unsqueeze(1)?, &qz_m, &qz_v)?;
    let log_pz = standard_normal_log_density(&zs)?;
    let log_px = marginal_log_likelihood(model, data, chunk, config, rng, device)?;

    let log_probs = importance_log_probs(&log_pz, &log_px_zs, &log_px, &log_qz)?;
    let windices = resample_indices(&log_probs, m, rng)?;
    let hs_weighted = hs.index_select(&index_tensor(&windices, hs.device())?, 0)?;

    Ok(ChunkSamples {
        zs,
        qz_m,
        qz_v,
        hs,
        log_px_zs,
        log_qz,
        log_pz,
        log_probs,
        hs_weighted,
    })
}

/// Cells of `indices` that belong to batch `transform_batch`
pub fn restrict_to_batch(
    data: &InMemoryData,
    indices: &[usize],
    transform_batch: usize,
) -> anyhow::Result<Vec<usize>> {
    let batch = data
        .batch()
        .ok_or_else(|| anyhow::anyhow!("transform batch {} without batch codes", transform_batch))?;
    if let Some(&bad) = indices.iter().find(|&&i| i >= batch.codes.len()) {
        return Err(anyhow::anyhow!(
            "index {} vs. {} batch codes",
            bad,
            batch.codes.len()
        ));
    }
    Ok(indices
        .iter()
        .copied()
        .filter(|&i| batch.codes[i] == transform_batch)
        .collect())
}

/// Posterior means of `rows` as an `f64` matrix
pub fn latent_means<M: GenerativeModelT>(
    model: &M,
    data: &InMemoryData,
    rows: &[usize],
    batch_size: usize,
    device: &Device,
) -> anyhow::Result<Mat> {
    let mut means: Vec<Vec<f32>> = Vec::with_capacity(rows.len());
    for (lb, ub) in generate_minibatch_intervals(rows.len(), batch_size) {
        let mb = data.take_rows(&rows[lb..ub], device)?;
        let (qz_m, _) = model.latent_posterior(&mb.input)?;
        means.extend(qz_m.to_dtype(DType::F32)?.to_vec2::<f32>()?);
    }
    let k = model.dim_latent();
    if means.iter().any(|r| r.len() != k) {
        return Err(anyhow::anyhow!("latent means are not {} wide", k));
    }
    Ok(Mat::from_fn(means.len(), k, |i, j| means[i][j] as f64))
}

/// `(draws per cell, profiles returned)` for `n_used > 0` sampled cells.
/// A requested total is spread over the cells with one spare draw each;
/// draws per cell stay within `1..=max_samples_per_cell`.
pub fn samples_per_cell(config: &PopulationConfig, n_used: usize) -> (usize, usize) {
    let (per_cell, overall) = match config.n_samples_overall {
        Some(overall) => (1 + overall.div_ceil(n_used.max(1)), overall),
        None => (config.n_samples, config.n_samples * n_used),
    };
    (per_cell.min(config.max_samples_per_cell).max(1), overall)
}

/// Importance-weighted `px_scale` profiles of a population
/// (`n_samples_overall x G`, `0 x G` for an empty population)
pub fn get_population_expression<M>(
    model: &M,
    data: &InMemoryData,
    indices: &[usize],
    config: &PopulationConfig,
    device: &Device,
) -> anyhow::Result<Tensor>
where
    M: GenerativeModelT + Sync,
{
    let n_genes = model.dim_obs();

    let indices = match config.transform_batch {
        Some(t) => restrict_to_batch(data, indices, t)?,
        None => indices.to_vec(),
    };
    if indices.is_empty() {
        return Ok(Tensor::zeros((0, n_genes), DType::F32, device)?);
    }

    let indices = if config.filter_cells {
        let qz_m = latent_means(model, data, &indices, config.batch_size, device)?;
        let kept = filter_cells(&indices, &qz_m, &EllipticEnvelope::default())?;
        debug!("kept {} of {} cells after outlier filtering", kept.len(), indices.len());
        kept
    } else {
        indices
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let chunks = split_into_chunks(&indices, config.n_cells_per_chunk, config.max_chunks, &mut rng);
    let n_used: usize = chunks.iter().map(|c| c.len()).sum();
    if n_used == 0 {
        debug!("no cells left to sample from");
        return Ok(Tensor::zeros((0, n_genes), DType::F32, device)?);
    }

    let (n_samples_per_cell, n_samples_overall) = samples_per_cell(config, n_used);

    info!(
        "{} cells in {} chunk(s), {} draws per cell",
        n_used,
        chunks.len(),
        n_samples_per_cell
    );

    let pb = ProgressBar::new(chunks.len() as u64);
    if !config.show_progress {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let run_chunk = |c: usize, chunk: &Vec<usize>| -> anyhow::Result<Tensor> {
        let mut chunk_rng = StdRng::seed_from_u64(config.seed.wrapping_add(c as u64 + 1));
        let out = sample_chunk(model, data, chunk, n_samples_per_cell, config, &mut chunk_rng, device)?;
        Ok(out.hs_weighted)
    };

    let weighted: Vec<Tensor> = if config.parallel_chunks {
        chunks
            .par_iter()
            .enumerate()
            .progress_with(pb.clone())
            .map(|(c, chunk)| run_chunk(c, chunk))
            .collect::<anyhow::Result<_>>()?
    } else {
        chunks
            .iter()
            .enumerate()
            .map(|(c, chunk)| {
                let out = run_chunk(c, chunk);
                pb.inc(1);
                out
            })
            .collect::<anyhow::Result<_>>()?
    };
    pb.finish_and_clear();

    let pooled = Tensor::cat(&weighted, 0)?;
    let npool = pooled.dim(0)?;
    let picks: Vec<usize> = (0..n_samples_overall)
        .map(|_| rng.random_range(0..npool))
        .collect();
    Ok(pooled.index_select(&index_tensor(&picks, device)?, 0)?)
}

/// Plug-in expression: `px_scale` at one posterior draw per cell,
/// repeated until about `n_samples` profiles are collected
pub fn get_normalized_expression<M: GenerativeModelT>(
    model: &M,
    data: &InMemoryData,
    indices: &[usize],
    n_samples: usize,
    config: &PopulationConfig,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let indices = match config.transform_batch {
        Some(t) => restrict_to_batch(data, indices, t)?,
        None => indices.to_vec(),
    };
    if indices.is_empty() {
        return Ok(Tensor::zeros((0, model.dim_obs()), DType::F32, device)?);
    }

    let repeats = (n_samples / indices.len()).max(1);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut out = vec![];
    for mb in minibatches(data, &indices, config, device)? {
        let library = log_library_size(&mb.input)?;
        let (qz_m, qz_v) = model.latent_posterior(&mb.input)?;
        let z = sample_posterior(&qz_m, &qz_v, repeats, &mut rng)?.flatten_to(1)?;
        out.push(decode_tiled(model, &z, &mb, &library, repeats)?.px_scale);
    }
    Ok(Tensor::cat(&out, 0)?)
}
