//! stats.rs  –  per‑block mean / variance of every gene
//! ====================================================
//! Four traversal kernels, picked from the matrix's preferred axis and
//! sparsity:
//!
//! * **row, dense**   – fetch one gene, two‑pass mean/variance per block.
//! * **row, sparse**  – same, but only non‑zeros are visited and the
//!   implicit zeros are added back from the block sizes.
//! * **column, dense**  – sweep every cell once; each worker keeps one
//!   Welford accumulator per (block, gene) for its own gene range.
//! * **column, sparse** – as above, Welford over non‑zeros only; the zeros
//!   are folded in when the accumulator is finished.
//!
//! Genes are partitioned into contiguous ranges (see `parallel.rs`).  A
//! worker only ever writes into its own slice of every output buffer.
//!
//! Variances are population variances (÷ n).  A block with no cells has a
//! NaN mean; a block with fewer than two cells has a NaN variance.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use log::debug;

use crate::error::{check_length, Result, VarianceError};
use crate::matrix::ExpressionMatrix;
use crate::parallel::{parallelize, partition_ranges, partition_width, split_outputs};

/// Number of cells in each block; the number of blocks is `max(id) + 1`.
pub fn tabulate_blocks(block: &[usize]) -> Result<Vec<usize>> {
    let nblocks = match block.iter().max() {
        Some(&m) => m
            .checked_add(1)
            .ok_or_else(|| VarianceError::invalid_input(format!("block id {m} is too large")))?,
        None => 0,
    };
    let mut counts = vec![0usize; nblocks];
    for &b in block {
        counts[b] += 1;
    }
    Ok(counts)
}

/// Block sizes for an optional assignment; `None` is one block of `ncol`.
pub fn block_sizes(block: Option<&[usize]>, ncol: usize) -> Result<Vec<usize>> {
    match block {
        Some(block) => tabulate_blocks(block),
        None => Ok(vec![ncol]),
    }
}

fn finish_mean(sum: f64, n: usize) -> f64 {
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

fn finish_variance(ss: f64, n: usize) -> f64 {
    if n < 2 {
        f64::NAN
    } else {
        ss / n as f64
    }
}

// -----------------------------------------------------------------------------
// direct (one gene at a time)
// -----------------------------------------------------------------------------

/// Mean and variance of a dense vector.
pub fn direct_dense(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    let mean = finish_mean(values.iter().sum(), n);
    let ss: f64 = values.iter().map(|&v| (v - mean) * (v - mean)).sum();
    (mean, finish_variance(ss, n))
}

/// Mean and variance of a vector of length `n` whose non‑zeros are `values`.
pub fn direct_sparse(values: &[f64], n: usize) -> (f64, f64) {
    let mean = finish_mean(values.iter().sum(), n);
    let mut ss: f64 = values.iter().map(|&v| (v - mean) * (v - mean)).sum();
    if n > 0 {
        ss += (n - values.len()) as f64 * mean * mean;
    }
    (mean, finish_variance(ss, n))
}

/// Per‑block mean and variance of one dense gene.
pub fn grouped_direct_dense(
    values: &[f64],
    block: &[usize],
    block_size: &[usize],
    means: &mut [f64],
    variances: &mut [f64],
) {
    means.fill(0.0);
    variances.fill(0.0);

    for (&v, &b) in values.iter().zip(block) {
        means[b] += v;
    }
    for (m, &n) in means.iter_mut().zip(block_size) {
        *m = finish_mean(*m, n);
    }

    for (&v, &b) in values.iter().zip(block) {
        let d = v - means[b];
        variances[b] += d * d;
    }
    for (s, &n) in variances.iter_mut().zip(block_size) {
        *s = finish_variance(*s, n);
    }
}

/// Per‑block mean and variance of one sparse gene.  `nonzero` is scratch
/// space of length equal to the number of blocks.
pub fn grouped_direct_sparse(
    values: &[f64],
    indices: &[usize],
    block: &[usize],
    block_size: &[usize],
    means: &mut [f64],
    variances: &mut [f64],
    nonzero: &mut [usize],
) {
    means.fill(0.0);
    variances.fill(0.0);
    nonzero.fill(0);

    for (&v, &i) in values.iter().zip(indices) {
        let b = block[i];
        means[b] += v;
        nonzero[b] += 1;
    }
    for (m, &n) in means.iter_mut().zip(block_size) {
        *m = finish_mean(*m, n);
    }

    for (&v, &i) in values.iter().zip(indices) {
        let b = block[i];
        let d = v - means[b];
        variances[b] += d * d;
    }
    for b in 0..block_size.len() {
        let n = block_size[b];
        if n > 0 {
            variances[b] += (n - nonzero[b]) as f64 * means[b] * means[b];
        }
        variances[b] = finish_variance(variances[b], n);
    }
}

// -----------------------------------------------------------------------------
// running (one cell at a time)
// -----------------------------------------------------------------------------

/// Welford accumulators for a contiguous range of genes, fed one dense
/// column slice at a time.  Writes straight into the borrowed outputs.
pub struct RunningDense<'a> {
    count: usize,
    means: &'a mut [f64],
    variances: &'a mut [f64],
}

impl<'a> RunningDense<'a> {
    pub fn new(means: &'a mut [f64], variances: &'a mut [f64]) -> Self {
        means.fill(0.0);
        variances.fill(0.0);
        Self { count: 0, means, variances }
    }

    pub fn add(&mut self, values: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((&v, m), s) in values.iter().zip(self.means.iter_mut()).zip(self.variances.iter_mut()) {
            let delta = v - *m;
            *m += delta / n;
            *s += delta * (v - *m);
        }
    }

    pub fn finish(self) {
        let n = self.count;
        if n == 0 {
            self.means.fill(f64::NAN);
        }
        for s in self.variances.iter_mut() {
            *s = finish_variance(*s, n);
        }
    }
}

/// Sparse counterpart of [`RunningDense`].  Only non‑zeros update the
/// accumulators; `finish` folds in the zeros implied by the cell count.
pub struct RunningSparse<'a> {
    count: usize,
    offset: usize,
    nonzero: Vec<usize>,
    means: &'a mut [f64],
    variances: &'a mut [f64],
}

impl<'a> RunningSparse<'a> {
    /// `offset` is the index of the first gene covered by the outputs.
    pub fn new(means: &'a mut [f64], variances: &'a mut [f64], offset: usize) -> Self {
        means.fill(0.0);
        variances.fill(0.0);
        let nonzero = vec![0; means.len()];
        Self { count: 0, offset, nonzero, means, variances }
    }

    pub fn add(&mut self, values: &[f64], indices: &[usize]) {
        self.count += 1;
        for (&v, &i) in values.iter().zip(indices) {
            let j = i - self.offset;
            self.nonzero[j] += 1;
            let m = &mut self.means[j];
            let delta = v - *m;
            *m += delta / self.nonzero[j] as f64;
            self.variances[j] += delta * (v - *m);
        }
    }

    pub fn finish(self) {
        let n = self.count;
        for ((m, s), &nz) in self.means.iter_mut().zip(self.variances.iter_mut()).zip(&self.nonzero) {
            if n == 0 {
                *m = f64::NAN;
                *s = f64::NAN;
                continue;
            }
            if nz < n {
                *s += *m * *m * (nz as f64) * ((n - nz) as f64) / n as f64;
                *m *= nz as f64 / n as f64;
            }
            *s = finish_variance(*s, n);
        }
    }
}

// -----------------------------------------------------------------------------
// traversal kernels
// -----------------------------------------------------------------------------

/// One worker's share: genes `[start, start + length)` and the matching
/// slice of every block's output buffers.
struct Job<'a> {
    start: usize,
    length: usize,
    means: Vec<&'a mut [f64]>,
    variances: Vec<&'a mut [f64]>,
}

fn make_jobs<'a>(
    ngenes: usize,
    num_threads: usize,
    means: Vec<&'a mut [f64]>,
    variances: Vec<&'a mut [f64]>,
) -> Vec<Job<'a>> {
    let width = partition_width(ngenes, num_threads);
    partition_ranges(ngenes, num_threads)
        .into_iter()
        .zip(split_outputs(means, width))
        .zip(split_outputs(variances, width))
        .map(|(((start, length), means), variances)| Job { start, length, means, variances })
        .collect()
}

fn dense_row_job<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    block: Option<&[usize]>,
    block_size: &[usize],
    job: Job<'_>,
) {
    let Job { start, length, mut means, mut variances } = job;
    let nblocks = block_size.len();
    let mut tmp_means = vec![0.0; nblocks];
    let mut tmp_vars = vec![0.0; nblocks];
    let mut buffer = Vec::with_capacity(mat.ncol());

    for k in 0..length {
        let values = mat.fetch_row(start + k, &mut buffer);
        match block {
            Some(block) => {
                grouped_direct_dense(values, block, block_size, &mut tmp_means, &mut tmp_vars);
                for b in 0..nblocks {
                    means[b][k] = tmp_means[b];
                    variances[b][k] = tmp_vars[b];
                }
            }
            None => {
                let (m, v) = direct_dense(values);
                means[0][k] = m;
                variances[0][k] = v;
            }
        }
    }
}

fn sparse_row_job<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    block: Option<&[usize]>,
    block_size: &[usize],
    job: Job<'_>,
) {
    let Job { start, length, mut means, mut variances } = job;
    let nblocks = block_size.len();
    let ncol = mat.ncol();
    let mut tmp_means = vec![0.0; nblocks];
    let mut tmp_vars = vec![0.0; nblocks];
    let mut tmp_nzero = vec![0usize; nblocks];
    let mut vbuffer = Vec::new();
    let mut ibuffer = Vec::new();

    for k in 0..length {
        let range = mat.fetch_sparse_row(start + k, &mut vbuffer, &mut ibuffer);
        match block {
            Some(block) => {
                grouped_direct_sparse(
                    range.value,
                    range.index,
                    block,
                    block_size,
                    &mut tmp_means,
                    &mut tmp_vars,
                    &mut tmp_nzero,
                );
                for b in 0..nblocks {
                    means[b][k] = tmp_means[b];
                    variances[b][k] = tmp_vars[b];
                }
            }
            None => {
                let (m, v) = direct_sparse(range.value, ncol);
                means[0][k] = m;
                variances[0][k] = v;
            }
        }
    }
}

fn dense_column_job<M: ExpressionMatrix + ?Sized>(mat: &M, block: Option<&[usize]>, job: Job<'_>) {
    let Job { start, length, means, variances } = job;
    let mut runners: Vec<RunningDense<'_>> = means
        .into_iter()
        .zip(variances)
        .map(|(m, v)| RunningDense::new(m, v))
        .collect();

    let mut buffer = Vec::with_capacity(length);
    for c in 0..mat.ncol() {
        let values = mat.fetch_column(c, start, length, &mut buffer);
        let b = block.map_or(0, |block| block[c]);
        runners[b].add(values);
    }
    runners.into_iter().for_each(RunningDense::finish);
}

fn sparse_column_job<M: ExpressionMatrix + ?Sized>(mat: &M, block: Option<&[usize]>, job: Job<'_>) {
    let Job { start, length, means, variances } = job;
    let mut runners: Vec<RunningSparse<'_>> = means
        .into_iter()
        .zip(variances)
        .map(|(m, v)| RunningSparse::new(m, v, start))
        .collect();

    let mut vbuffer = Vec::new();
    let mut ibuffer = Vec::new();
    for c in 0..mat.ncol() {
        let range = mat.fetch_sparse_column(c, start, length, &mut vbuffer, &mut ibuffer);
        let b = block.map_or(0, |block| block[c]);
        runners[b].add(range.value, range.index);
    }
    runners.into_iter().for_each(RunningSparse::finish);
}

//=========================================================================//
//  public entry points                                                    //
//=========================================================================//

/// Fill `means[b]` / `variances[b]` (each of length `nrow`) for every block.
///
/// `block_size` must come from [`block_sizes`] for the same assignment.
pub fn compute_blocked_stats<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    block: Option<&[usize]>,
    block_size: &[usize],
    means: Vec<&mut [f64]>,
    variances: Vec<&mut [f64]>,
    num_threads: usize,
) -> Result<()> {
    let (nrow, ncol) = (mat.nrow(), mat.ncol());
    let nblocks = block_size.len();

    if let Some(block) = block {
        check_length("block", block.len(), ncol)?;
        if let Some(&bad) = block.iter().find(|&&b| b >= nblocks) {
            return Err(VarianceError::invalid_input(format!(
                "block id {bad} out of range for {nblocks} blocks"
            )));
        }
    } else if nblocks != 1 {
        return Err(VarianceError::invalid_input("unblocked input must have exactly one block"));
    }
    check_length("means", means.len(), nblocks)?;
    check_length("variances", variances.len(), nblocks)?;
    for (m, v) in means.iter().zip(&variances) {
        check_length("means[b]", m.len(), nrow)?;
        check_length("variances[b]", v.len(), nrow)?;
    }

    let num_threads = num_threads.max(1);
    let jobs = make_jobs(nrow, num_threads, means, variances);

    match (mat.prefer_rows(), mat.is_sparse()) {
        (true, false) => {
            debug!("dense row traversal: {nrow} genes, {nblocks} block(s), {num_threads} worker(s)");
            parallelize(num_threads, jobs, |job| dense_row_job(mat, block, block_size, job))
        }
        (true, true) => {
            debug!("sparse row traversal: {nrow} genes, {nblocks} block(s), {num_threads} worker(s)");
            parallelize(num_threads, jobs, |job| sparse_row_job(mat, block, block_size, job))
        }
        (false, false) => {
            debug!("dense column traversal: {nrow} genes, {nblocks} block(s), {num_threads} worker(s)");
            parallelize(num_threads, jobs, |job| dense_column_job(mat, block, job))
        }
        (false, true) => {
            debug!("sparse column traversal: {nrow} genes, {nblocks} block(s), {num_threads} worker(s)");
            parallelize(num_threads, jobs, |job| sparse_column_job(mat, block, job))
        }
    }
}

/// Owned per‑block statistics.
#[derive(Debug, Clone)]
pub struct BlockedStats {
    pub block_size: Vec<usize>,
    pub means: Vec<Vec<f64>>,
    pub variances: Vec<Vec<f64>>,
}

/// Allocating wrapper around [`compute_blocked_stats`].
pub fn blocked_stats<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    block: Option<&[usize]>,
    num_threads: usize,
) -> Result<BlockedStats> {
    let block_size = block_sizes(block, mat.ncol())?;
    let nrow = mat.nrow();
    let mut means = vec![vec![0.0; nrow]; block_size.len()];
    let mut variances = vec![vec![0.0; nrow]; block_size.len()];

    compute_blocked_stats(
        mat,
        block,
        &block_size,
        means.iter_mut().map(|m| &mut m[..]).collect(),
        variances.iter_mut().map(|v| &mut v[..]).collect(),
        num_threads,
    )?;

    Ok(BlockedStats { block_size, means, variances })
}
