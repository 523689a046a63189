//! parallel.rs  –  contiguous gene partitions over a rayon pool
//! ============================================================
//! Genes `[0, n)` are cut into at most `workers` contiguous ranges of
//! equal width (the last one may be shorter).  Each job owns its slice of
//! every output buffer, obtained with `chunks_mut`, so workers never share
//! mutable state and no locking is needed.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::Result;

/// Width of each partition when `n` genes are split across `workers`.
pub fn partition_width(n: usize, workers: usize) -> usize {
    let workers = workers.max(1);
    n.div_ceil(workers).max(1)
}

/// `(start, length)` of every partition.
pub fn partition_ranges(n: usize, workers: usize) -> Vec<(usize, usize)> {
    let width = partition_width(n, workers);
    (0..n)
        .step_by(width)
        .map(|start| (start, width.min(n - start)))
        .collect()
}

/// Cut every buffer into the same partitions and regroup so that entry
/// `p` holds the `p`‑th chunk of each buffer.
pub fn split_outputs<'a>(buffers: Vec<&'a mut [f64]>, width: usize) -> Vec<Vec<&'a mut [f64]>> {
    let mut chunked: Vec<_> = buffers.into_iter().map(|b| b.chunks_mut(width)).collect();
    let nparts = chunked.first().map(|it| it.len()).unwrap_or(0);
    (0..nparts)
        .map(|_| chunked.iter_mut().filter_map(Iterator::next).collect())
        .collect()
}

/// Run one job per partition.  A single worker (or a single job) runs in
/// order on the calling thread, which is bit‑for‑bit the sequential path.
pub fn parallelize<J, F>(num_threads: usize, jobs: Vec<J>, f: F) -> Result<()>
where
    J: Send,
    F: Fn(J) + Sync + Send,
{
    if num_threads <= 1 || jobs.len() <= 1 {
        jobs.into_iter().for_each(f);
        return Ok(());
    }

    let pool = ThreadPoolBuilder::new().num_threads(num_threads).build()?;
    pool.install(|| jobs.into_par_iter().for_each(f));
    Ok(())
}

// ------------------- tests -------------------
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_everything_once() {
        assert_eq!(partition_ranges(10, 3), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(partition_ranges(2, 8), vec![(0, 1), (1, 1)]);
        assert_eq!(partition_ranges(5, 0), vec![(0, 5)]);
        assert!(partition_ranges(0, 4).is_empty());
    }

    #[test]
    fn split_regroups_per_partition() {
        let mut a = vec![0.0; 5];
        let mut b = vec![0.0; 5];
        let parts = split_outputs(vec![&mut a[..], &mut b[..]], 2);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() == 2));
        assert_eq!(parts[2][0].len(), 1);
    }

    #[test]
    fn jobs_write_disjoint_chunks() {
        let mut out = vec![0.0; 9];
        let width = partition_width(9, 3);
        let jobs: Vec<_> = out.chunks_mut(width).enumerate().collect();
        parallelize(3, jobs, |(p, chunk)| {
            for v in chunk.iter_mut() {
                *v = p as f64;
            }
        })
        .unwrap();
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }
}
