//! lib.rs – public API for per‑gene variance modelling
//! ===================================================
//! Genes × cells expression matrices in, highly variable genes out:
//!
//! * Matrix access (sprs CSR/CSC, ndarray C/F)   → `ExpressionMatrix` matrix.rs
//! * Blocked per‑gene mean / variance           → `blocked_stats()` stats.rs
//! * Contiguous gene partitions on rayon         → parallel.rs
//! * LOWESS smoother behind a trait              → `Lowess` lowess.rs
//! * Mean–variance trend + residuals             → `fit_variance_trend()` trend.rs
//! * Cross‑block weighting / quantile averaging  → blocks.rs
//! * End‑to‑end modelling                        → `model_gene_variances*()` model.rs
//! * Top‑k selection                             → `choose_highly_variable_genes*()` hvg.rs
//!
//! Logging goes through the `log` facade; install any logger to see it.
//!
//! -------------------------------------------------------------------------
//! Copyright © 2025 Scott Furlan – MIT OR Apache‑2.0.

// ---- project modules ----------------------------------------------------
pub mod blocks;
pub mod error;
pub mod hvg;
pub mod lowess;
pub mod matrix;
pub mod model;
pub mod parallel;
pub mod stats;
pub mod trend;

//=========================================================================//
//  re‑exports                                                             //
//=========================================================================//

pub use blocks::{
    average_vectors_weighted, compute_variable_weight, compute_weights, quantile_vectors, AggregationOptions,
    AveragePolicy, VariableWeightParameters, WeightPolicy,
};
pub use error::{Result, VarianceError};
pub use hvg::{
    choose_highly_variable_genes, choose_highly_variable_genes_index, choose_highly_variable_genes_into,
    SelectionOptions,
};
pub use lowess::{Lowess, Smoother, SmoothingWindow};
pub use matrix::{ExpressionMatrix, SparseRange};
pub use model::{
    model_gene_variances, model_gene_variances_blocked, model_gene_variances_blocked_into, model_gene_variances_into,
    AverageBuffers, BlockedVarianceBuffers, BlockedVarianceResults, VarianceBuffers, VarianceModelOptions,
    VarianceResults,
};
pub use stats::{blocked_stats, compute_blocked_stats, BlockedStats};
pub use trend::{
    fit_variance_trend, fit_variance_trend_results, fit_variance_trend_with, TrendFitOptions, TrendFitResults,
    TrendFitWorkspace,
};

//=========================================================================//
//  tests                                                                  //
//=========================================================================//
