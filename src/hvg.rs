//! hvg.rs  –  choose highly variable genes
//! =======================================
//! Top‑`k` of a per‑gene statistic (usually the residuals).
//!
//! * NaN never makes the cut.
//! * With `use_bound`, genes on the wrong side of `bound` are dropped
//!   *before* ranking, which may leave fewer than `top`.
//! * The `top`‑th value is found with `select_nth_unstable_by`; equal
//!   values are ranked by gene index.
//! * `keep_ties` also keeps everything tied with that value.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use std::cmp::Ordering;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{check_length, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionOptions {
    pub top: usize,
    /// Larger values are more variable.
    pub larger: bool,
    pub keep_ties: bool,
    pub use_bound: bool,
    pub bound: f64,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self { top: 4000, larger: true, keep_ties: true, use_bound: false, bound: 0.0 }
    }
}

impl SelectionOptions {
    fn passes(&self, v: f64) -> bool {
        if v.is_nan() {
            return false;
        }
        if !self.use_bound {
            return true;
        }
        if self.larger {
            v > self.bound
        } else {
            v < self.bound
        }
    }

    /// `Less` = more extreme.  Only called on non‑NaN values, so IEEE
    /// equality holds (`-0.0 == 0.0`).
    fn rank(&self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        if self.larger {
            ord.reverse()
        } else {
            ord
        }
    }

    fn at_least_as_extreme(&self, v: f64, threshold: f64) -> bool {
        if self.larger {
            v >= threshold
        } else {
            v <= threshold
        }
    }
}

/// Write the retention mask into `output`.
pub fn choose_highly_variable_genes_into(
    statistic: &[f64],
    output: &mut [bool],
    options: &SelectionOptions,
) -> Result<()> {
    let n = statistic.len();
    check_length("output", output.len(), n)?;
    output.fill(false);

    let mut candidates: Vec<usize> = (0..n).filter(|&i| options.passes(statistic[i])).collect();
    let top = options.top;

    if top == 0 || candidates.is_empty() {
        debug!("retained 0 of {n} genes");
        return Ok(());
    }

    if top >= candidates.len() {
        for &i in &candidates {
            output[i] = true;
        }
        debug!("retained {} of {n} genes", candidates.len());
        return Ok(());
    }

    let k = top - 1;
    candidates.select_nth_unstable_by(k, |&a, &b| options.rank(statistic[a], statistic[b]).then(a.cmp(&b)));
    let threshold = statistic[candidates[k]];

    let mut retained = 0;
    if options.keep_ties {
        for &i in &candidates {
            if options.at_least_as_extreme(statistic[i], threshold) {
                output[i] = true;
                retained += 1;
            }
        }
    } else {
        for &i in &candidates[..=k] {
            output[i] = true;
        }
        retained = top;
    }

    debug!("retained {retained} of {n} genes (threshold {threshold})");
    Ok(())
}

pub fn choose_highly_variable_genes(statistic: &[f64], options: &SelectionOptions) -> Result<Vec<bool>> {
    let mut output = vec![false; statistic.len()];
    choose_highly_variable_genes_into(statistic, &mut output, options)?;
    Ok(output)
}

/// Retained genes as sorted, unique indices.
pub fn choose_highly_variable_genes_index(statistic: &[f64], options: &SelectionOptions) -> Result<Vec<usize>> {
    let mask = choose_highly_variable_genes(statistic, options)?;
    Ok(mask.iter().enumerate().filter(|&(_, &keep)| keep).map(|(i, _)| i).collect())
}
