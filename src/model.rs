//! model.rs  –  per‑gene variance modelling, end to end
//! ====================================================
//! `blocked stats → trend per block → cross‑block average`.
//!
//! * Statistics for all blocks come from one parallel sweep (`stats.rs`).
//! * Blocks are then fitted one after the other, reusing one workspace.
//!   Blocks with fewer than two cells get NaN fitted values / residuals.
//! * Averages honour a minimum block size per statistic: 1 for means,
//!   2 for variances, fitted values and residuals.  An absent output slot
//!   is simply skipped.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::blocks::{average_vectors_weighted, compute_weights, quantile_vectors, AggregationOptions, AveragePolicy};
use crate::error::{check_length, Result};
use crate::lowess::Lowess;
use crate::matrix::ExpressionMatrix;
use crate::stats::{block_sizes, compute_blocked_stats};
use crate::trend::{fit_variance_trend_with, TrendFitOptions, TrendFitWorkspace};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceModelOptions {
    pub trend: TrendFitOptions,
    pub aggregation: AggregationOptions,
}

//=========================================================================//
//  buffers & results                                                      //
//=========================================================================//

/// Caller‑owned outputs for one block, each of length `nrow`.
#[derive(Debug)]
pub struct VarianceBuffers<'a> {
    pub means: &'a mut [f64],
    pub variances: &'a mut [f64],
    pub fitted: &'a mut [f64],
    pub residuals: &'a mut [f64],
}

/// Optional averaged outputs; `None` slots are not computed.
#[derive(Debug, Default)]
pub struct AverageBuffers<'a> {
    pub means: Option<&'a mut [f64]>,
    pub variances: Option<&'a mut [f64]>,
    pub fitted: Option<&'a mut [f64]>,
    pub residuals: Option<&'a mut [f64]>,
}

impl AverageBuffers<'_> {
    fn is_empty(&self) -> bool {
        self.means.is_none() && self.variances.is_none() && self.fitted.is_none() && self.residuals.is_none()
    }
}

#[derive(Debug)]
pub struct BlockedVarianceBuffers<'a> {
    pub per_block: Vec<VarianceBuffers<'a>>,
    pub average: AverageBuffers<'a>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarianceResults {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
}

impl VarianceResults {
    pub fn new(nrow: usize) -> Self {
        Self {
            means: vec![0.0; nrow],
            variances: vec![0.0; nrow],
            fitted: vec![0.0; nrow],
            residuals: vec![0.0; nrow],
        }
    }

    pub fn buffers(&mut self) -> VarianceBuffers<'_> {
        VarianceBuffers {
            means: &mut self.means,
            variances: &mut self.variances,
            fitted: &mut self.fitted,
            residuals: &mut self.residuals,
        }
    }

    fn average_buffers(&mut self) -> AverageBuffers<'_> {
        AverageBuffers {
            means: Some(&mut self.means),
            variances: Some(&mut self.variances),
            fitted: Some(&mut self.fitted),
            residuals: Some(&mut self.residuals),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockedVarianceResults {
    pub per_block: Vec<VarianceResults>,
    /// `None` when the average policy is `None`.
    pub average: Option<VarianceResults>,
}

//=========================================================================//
//  entry points                                                           //
//=========================================================================//

/// Model every block and (optionally) average across blocks.
pub fn model_gene_variances_blocked_into<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    block: Option<&[usize]>,
    buffers: BlockedVarianceBuffers<'_>,
    options: &VarianceModelOptions,
) -> Result<()> {
    let nrow = mat.nrow();
    let block_size = block_sizes(block, mat.ncol())?;
    let nblocks = block_size.len();
    let num_threads = options.aggregation.num_threads.max(1);

    let BlockedVarianceBuffers { mut per_block, average } = buffers;
    check_length("per_block", per_block.len(), nblocks)?;
    for buf in &per_block {
        check_length("fitted", buf.fitted.len(), nrow)?;
        check_length("residuals", buf.residuals.len(), nrow)?;
    }
    debug!("modelling {nrow} genes across {nblocks} block(s) with {num_threads} worker(s)");

    // ---- 1. statistics
    let (means, variances): (Vec<&mut [f64]>, Vec<&mut [f64]>) = per_block
        .iter_mut()
        .map(|b| (&mut *b.means, &mut *b.variances))
        .unzip();
    compute_blocked_stats(mat, block, &block_size, means, variances, num_threads)?;

    // ---- 2. trend per block
    let smoother = Lowess::default();
    let mut workspace = TrendFitWorkspace::new();
    for (b, buf) in per_block.iter_mut().enumerate() {
        if block_size[b] < 2 {
            debug!("block {b} has {} cell(s), no trend fitted", block_size[b]);
            buf.fitted.fill(f64::NAN);
            buf.residuals.fill(f64::NAN);
            continue;
        }
        fit_variance_trend_with(
            &smoother,
            &mut workspace,
            buf.means,
            buf.variances,
            buf.fitted,
            buf.residuals,
            &options.trend,
        )?;
    }

    // ---- 3. averages
    let aggr = &options.aggregation;
    if aggr.average_policy == AveragePolicy::None || average.is_empty() {
        return Ok(());
    }
    let weights = match aggr.average_policy {
        AveragePolicy::Mean => compute_weights(&block_size, aggr.block_weight_policy, &aggr.variable_weight_parameters),
        _ => Vec::new(),
    };
    let averager = Averager { block_size: &block_size, weights: &weights, options: aggr, nrow };

    let AverageBuffers { means, variances, fitted, residuals } = average;
    averager.run(per_block.iter().map(|b| &*b.means), 1, means)?;
    averager.run(per_block.iter().map(|b| &*b.variances), 2, variances)?;
    averager.run(per_block.iter().map(|b| &*b.fitted), 2, fitted)?;
    averager.run(per_block.iter().map(|b| &*b.residuals), 2, residuals)?;
    Ok(())
}

struct Averager<'a> {
    block_size: &'a [usize],
    weights: &'a [f64],
    options: &'a AggregationOptions,
    nrow: usize,
}

impl Averager<'_> {
    /// Average one statistic over the blocks with at least `min_size` cells.
    fn run<'x>(
        &self,
        per_block: impl Iterator<Item = &'x [f64]>,
        min_size: usize,
        output: Option<&mut [f64]>,
    ) -> Result<()> {
        let Some(output) = output else {
            return Ok(());
        };
        check_length("average", output.len(), self.nrow)?;

        let mut inputs = Vec::new();
        let mut weights = Vec::new();
        for (b, x) in per_block.enumerate() {
            if self.block_size[b] >= min_size {
                inputs.push(x);
                if let Some(&w) = self.weights.get(b) {
                    weights.push(w);
                }
            }
        }

        if inputs.is_empty() {
            warn!("no block has at least {min_size} cell(s), average is NaN");
        }

        match self.options.average_policy {
            AveragePolicy::Mean => average_vectors_weighted(&inputs, &weights, output),
            AveragePolicy::Quantile => quantile_vectors(&inputs, self.options.quantile, output),
            AveragePolicy::None => Ok(()),
        }
    }
}

/// Single‑block variant writing into caller buffers.
pub fn model_gene_variances_into<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    buffers: VarianceBuffers<'_>,
    options: &VarianceModelOptions,
) -> Result<()> {
    let blocked = BlockedVarianceBuffers { per_block: vec![buffers], average: AverageBuffers::default() };
    model_gene_variances_blocked_into(mat, None, blocked, options)
}

/// Single‑block variant returning owned results.
pub fn model_gene_variances<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    options: &VarianceModelOptions,
) -> Result<VarianceResults> {
    let mut out = VarianceResults::new(mat.nrow());
    model_gene_variances_into(mat, out.buffers(), options)?;
    Ok(out)
}

/// Blocked variant returning owned per‑block results and the average.
pub fn model_gene_variances_blocked<M: ExpressionMatrix + ?Sized>(
    mat: &M,
    block: Option<&[usize]>,
    options: &VarianceModelOptions,
) -> Result<BlockedVarianceResults> {
    let nrow = mat.nrow();
    let nblocks = block_sizes(block, mat.ncol())?.len();
    let mut per_block: Vec<VarianceResults> = (0..nblocks).map(|_| VarianceResults::new(nrow)).collect();
    let mut average = match options.aggregation.average_policy {
        AveragePolicy::None => None,
        _ => Some(VarianceResults::new(nrow)),
    };

    let buffers = BlockedVarianceBuffers {
        per_block: per_block.iter_mut().map(VarianceResults::buffers).collect(),
        average: average.as_mut().map(VarianceResults::average_buffers).unwrap_or_default(),
    };
    model_gene_variances_blocked_into(mat, block, buffers, options)?;

    Ok(BlockedVarianceResults { per_block, average })
}

// ------------------- tests -------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{VariableWeightParameters, WeightPolicy};
    use crate::stats::blocked_stats;
    use crate::stats::tests::{assert_close, simulate, to_csc, to_csr, to_fortran};
    use crate::trend::fit_variance_trend_results;

    fn three_blocks(ncol: usize) -> Vec<usize> {
        (0..ncol).map(|c| c % 3).collect()
    }

    fn with_average(policy: AveragePolicy, weight: WeightPolicy) -> VarianceModelOptions {
        let mut opt = VarianceModelOptions::default();
        opt.aggregation.average_policy = policy;
        opt.aggregation.block_weight_policy = weight;
        opt
    }

    #[test]
    fn unblocked_is_stats_plus_trend() {
        let x = simulate(120, 50, 0.3, 1);
        let opt = VarianceModelOptions::default();
        let res = model_gene_variances(&x, &opt).unwrap();

        let stats = blocked_stats(&x, None, 1).unwrap();
        assert_eq!(res.means, stats.means[0]);
        assert_eq!(res.variances, stats.variances[0]);

        let trend = fit_variance_trend_results(&res.means, &res.variances, &opt.trend).unwrap();
        assert_eq!(res.fitted, trend.fitted);
        assert_eq!(res.residuals, trend.residuals);
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let x = simulate(97, 40, 0.25, 2);
        let block = three_blocks(40);
        let mut serial = VarianceModelOptions::default();
        serial.aggregation.num_threads = 1;
        let mut threaded = serial.clone();
        threaded.aggregation.num_threads = 3;

        let reference = model_gene_variances_blocked(&x, Some(&block), &serial).unwrap();
        let f = to_fortran(&x);
        let csr = to_csr(&x);
        let csc = to_csc(&x);
        let mats: [&dyn ExpressionMatrix; 4] = [&x, &f, &csr, &csc];
        for mat in mats {
            let one = model_gene_variances_blocked(mat, Some(&block), &serial).unwrap();
            let many = model_gene_variances_blocked(mat, Some(&block), &threaded).unwrap();
            assert_eq!(one, many);

            for (a, b) in one.per_block.iter().zip(&reference.per_block) {
                assert_close(&a.means, &b.means);
                assert_close(&a.variances, &b.variances);
            }
        }
    }

    #[test]
    fn equal_weights_give_arithmetic_mean() {
        let x = simulate(80, 60, 0.3, 3);
        let block = three_blocks(60);
        let res = model_gene_variances_blocked(&x, Some(&block), &with_average(AveragePolicy::Mean, WeightPolicy::Equal))
            .unwrap();
        let avg = res.average.unwrap();

        let mean_of = |vectors: Vec<&Vec<f64>>| -> Vec<f64> {
            (0..80).map(|g| vectors.iter().map(|v| v[g]).sum::<f64>() / 3.0).collect()
        };
        let blocks = &res.per_block;
        assert_close(&avg.means, &mean_of(blocks.iter().map(|b| &b.means).collect()));
        assert_close(&avg.variances, &mean_of(blocks.iter().map(|b| &b.variances).collect()));
        assert_close(&avg.fitted, &mean_of(blocks.iter().map(|b| &b.fitted).collect()));
        assert_close(&avg.residuals, &mean_of(blocks.iter().map(|b| &b.residuals).collect()));
    }

    #[test]
    fn variable_weights_reduce_to_other_policies() {
        let x = simulate(60, 50, 0.3, 4);
        let block: Vec<usize> = (0..50).map(|c| if c < 10 { 0 } else if c < 25 { 1 } else { 2 }).collect();

        let run = |weight: WeightPolicy, params: VariableWeightParameters| {
            let mut opt = with_average(AveragePolicy::Mean, weight);
            opt.aggregation.variable_weight_parameters = params;
            model_gene_variances_blocked(&x, Some(&block), &opt).unwrap().average.unwrap()
        };
        let defaults = VariableWeightParameters::default();

        let flat = run(WeightPolicy::Variable, VariableWeightParameters { lower_bound: 0.0, upper_bound: 0.0 });
        let equal = run(WeightPolicy::Equal, defaults);
        assert_close(&flat.variances, &equal.variances);
        assert_close(&flat.residuals, &equal.residuals);

        let ramp = run(WeightPolicy::Variable, VariableWeightParameters { lower_bound: 0.0, upper_bound: 100_000.0 });
        let sized = run(WeightPolicy::None, defaults);
        assert_close(&ramp.means, &sized.means);
        assert_close(&ramp.residuals, &sized.residuals);
    }

    #[test]
    fn median_of_three_blocks() {
        let x = simulate(70, 45, 0.35, 5);
        let block = three_blocks(45);
        let res = model_gene_variances_blocked(&x, Some(&block), &with_average(AveragePolicy::Quantile, WeightPolicy::Equal))
            .unwrap();
        let avg = res.average.unwrap();

        for g in 0..70 {
            let mut v: Vec<f64> = res.per_block.iter().map(|b| b.residuals[g]).collect();
            v.sort_by(|a, b| a.total_cmp(b));
            assert_eq!(avg.residuals[g], v[1]);
        }
    }

    #[test]
    fn single_cell_block_is_excluded_from_variance_averages() {
        let x = simulate(50, 41, 0.3, 6);
        let block: Vec<usize> = (0..41).map(|c| if c == 0 { 1 } else if c % 2 == 1 { 0 } else { 2 }).collect();
        let opt = VarianceModelOptions::default();
        let res = model_gene_variances_blocked(&x, Some(&block), &opt).unwrap();

        let tiny = &res.per_block[1];
        assert!(tiny.means.iter().all(|v| v.is_finite()));
        assert!(tiny.variances.iter().all(|v| v.is_nan()));
        assert!(tiny.fitted.iter().all(|v| v.is_nan()));
        assert!(tiny.residuals.iter().all(|v| v.is_nan()));

        let avg = res.average.unwrap();
        assert!(avg.variances.iter().all(|v| v.is_finite()));

        let params = &opt.aggregation.variable_weight_parameters;
        let w = compute_weights(&[20, 1, 20], WeightPolicy::Variable, params);
        let mut expected = vec![0.0; 50];
        average_vectors_weighted(
            &[&res.per_block[0].variances, &res.per_block[2].variances],
            &[w[0], w[2]],
            &mut expected,
        )
        .unwrap();
        assert_eq!(avg.variances, expected);

        average_vectors_weighted(
            &[&res.per_block[0].means, &res.per_block[1].means, &res.per_block[2].means],
            &w,
            &mut expected,
        )
        .unwrap();
        assert_eq!(avg.means, expected);
    }

    #[test]
    fn empty_block_survives_column_traversal() {
        let x = simulate(40, 36, 0.3, 9);
        // ids 0 and 2 only: block 1 is empty
        let block: Vec<usize> = (0..36).map(|c| if c % 4 == 0 || c % 4 == 3 { 0 } else { 2 }).collect();
        let opt = VarianceModelOptions::default();
        let reference = model_gene_variances_blocked(&x, Some(&block), &opt).unwrap();

        let f = to_fortran(&x);
        let csc = to_csc(&x);
        let mats: [&dyn ExpressionMatrix; 2] = [&f, &csc];
        for mat in mats {
            assert!(!mat.prefer_rows());
            let res = model_gene_variances_blocked(mat, Some(&block), &opt).unwrap();
            assert_eq!(res.per_block.len(), 3);

            let empty = &res.per_block[1];
            for stat in [&empty.means, &empty.variances, &empty.fitted, &empty.residuals] {
                assert!(stat.iter().all(|v| v.is_nan()));
            }

            let avg = res.average.unwrap();
            let expected = reference.average.as_ref().unwrap();
            for stat in [&avg.means, &avg.variances, &avg.fitted, &avg.residuals] {
                assert!(stat.iter().all(|v| v.is_finite()));
            }
            assert_close(&avg.means, &expected.means);
            assert_close(&avg.variances, &expected.variances);
        }
    }

    #[test]
    fn absent_average_slots_are_left_alone() {
        let x = simulate(30, 24, 0.4, 7);
        let block = three_blocks(24);
        let mut per_block: Vec<VarianceResults> = (0..3).map(|_| VarianceResults::new(30)).collect();
        let mut avg_var = vec![-1.0; 30];
        let buffers = BlockedVarianceBuffers {
            per_block: per_block.iter_mut().map(VarianceResults::buffers).collect(),
            average: AverageBuffers { variances: Some(&mut avg_var), ..Default::default() },
        };
        model_gene_variances_blocked_into(&x, Some(&block), buffers, &VarianceModelOptions::default()).unwrap();
        assert!(avg_var.iter().all(|&v| v >= 0.0));

        let none = with_average(AveragePolicy::None, WeightPolicy::Equal);
        let res = model_gene_variances_blocked(&x, Some(&block), &none).unwrap();
        assert!(res.average.is_none());
        assert_eq!(res.per_block.len(), 3);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let x = simulate(10, 12, 0.5, 8);
        let mut one = VarianceResults::new(10);
        let buffers = BlockedVarianceBuffers { per_block: vec![one.buffers()], average: AverageBuffers::default() };
        let block = three_blocks(12);
        assert!(model_gene_variances_blocked_into(&x, Some(&block), buffers, &VarianceModelOptions::default()).is_err());

        assert!(model_gene_variances_blocked(&x, Some(&block[..5]), &VarianceModelOptions::default()).is_err());
    }

    #[test]
    fn partial_options_take_defaults() {
        let opt: VarianceModelOptions =
            serde_json::from_str(r#"{"aggregation": {"average_policy": "quantile", "num_threads": 4}}"#).unwrap();
        assert_eq!(opt.aggregation.average_policy, AveragePolicy::Quantile);
        assert_eq!(opt.aggregation.num_threads, 4);
        assert_eq!(opt.aggregation.quantile, 0.5);
        assert_eq!(opt.trend, TrendFitOptions::default());
    }
}
