//! blocks.rs  –  combining per‑block statistics into one value per gene
//! ====================================================================
//! Two policies:
//! * **weighted mean** – weights come from the block sizes
//!   ([`compute_weights`]) and are normalised by their total;
//! * **quantile** – per gene, sort the block values and take element
//!   `floor(q·(k−1))` (lower median for `q = 0.5`).
//!
//! Callers pass only the *eligible* blocks; undersized blocks are dropped
//! before they get here (see `model.rs`).
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use serde::{Deserialize, Serialize};

use crate::error::{check_length, Result, VarianceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPolicy {
    /// Proportional to block size.
    None,
    /// Every non‑empty block counts the same.
    Equal,
    /// Linear ramp between `lower_bound` and `upper_bound`, flat above.
    #[default]
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableWeightParameters {
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl Default for VariableWeightParameters {
    fn default() -> Self {
        Self { lower_bound: 0.0, upper_bound: 1000.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AveragePolicy {
    None,
    #[default]
    Mean,
    Quantile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationOptions {
    pub block_weight_policy: WeightPolicy,
    pub variable_weight_parameters: VariableWeightParameters,
    pub average_policy: AveragePolicy,
    /// Only read by [`AveragePolicy::Quantile`].
    pub quantile: f64,
    /// 0 is treated as 1.
    pub num_threads: usize,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            block_weight_policy: WeightPolicy::default(),
            variable_weight_parameters: VariableWeightParameters::default(),
            average_policy: AveragePolicy::default(),
            quantile: 0.5,
            num_threads: 1,
        }
    }
}

/// Weight of a single block of `size` cells under the variable policy.
pub fn compute_variable_weight(size: f64, params: &VariableWeightParameters) -> f64 {
    if size == 0.0 || size < params.lower_bound {
        return 0.0;
    }
    if size >= params.upper_bound {
        return 1.0;
    }
    (size - params.lower_bound) / (params.upper_bound - params.lower_bound)
}

/// One (unnormalised) weight per block.
pub fn compute_weights(block_size: &[usize], policy: WeightPolicy, params: &VariableWeightParameters) -> Vec<f64> {
    block_size
        .iter()
        .map(|&s| match policy {
            WeightPolicy::None => s as f64,
            WeightPolicy::Equal => {
                if s > 0 {
                    1.0
                } else {
                    0.0
                }
            }
            WeightPolicy::Variable => compute_variable_weight(s as f64, params),
        })
        .collect()
}

/// `output[g] = Σ_b w_b · inputs[b][g] / Σ_b w_b`.
///
/// Zero‑weight inputs are skipped entirely, so they may hold NaN.  No
/// inputs or a zero total gives NaN everywhere.
pub fn average_vectors_weighted(inputs: &[&[f64]], weights: &[f64], output: &mut [f64]) -> Result<()> {
    check_length("weights", weights.len(), inputs.len())?;
    for x in inputs {
        check_length("inputs[b]", x.len(), output.len())?;
    }

    let total: f64 = weights.iter().sum();
    if inputs.is_empty() || !(total > 0.0) {
        output.fill(f64::NAN);
        return Ok(());
    }

    output.fill(0.0);
    for (x, &w) in inputs.iter().zip(weights) {
        if w == 0.0 {
            continue;
        }
        let scale = w / total;
        for (o, &v) in output.iter_mut().zip(x.iter()) {
            *o += v * scale;
        }
    }
    Ok(())
}

/// Per gene, the `quantile` of the block values (no interpolation).
pub fn quantile_vectors(inputs: &[&[f64]], quantile: f64, output: &mut [f64]) -> Result<()> {
    if !(0.0..=1.0).contains(&quantile) {
        return Err(VarianceError::invalid_input(format!("quantile {quantile} outside [0, 1]")));
    }
    for x in inputs {
        check_length("inputs[b]", x.len(), output.len())?;
    }
    if inputs.is_empty() {
        output.fill(f64::NAN);
        return Ok(());
    }

    let k = inputs.len();
    let pick = (quantile * (k - 1) as f64).floor() as usize;
    let mut buffer = Vec::with_capacity(k);
    for (g, o) in output.iter_mut().enumerate() {
        buffer.clear();
        buffer.extend(inputs.iter().map(|x| x[g]));
        // NaN last
        buffer.sort_by(|a, b| match (a.is_nan(), b.is_nan()) {
            (false, false) => a.total_cmp(b),
            (x, y) => x.cmp(&y),
        });
        *o = buffer[pick];
    }
    Ok(())
}

// ------------------- tests -------------------
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn weights_follow_policy() {
        let sizes = [0, 10, 500, 2000];
        let params = VariableWeightParameters::default();
        assert_eq!(compute_weights(&sizes, WeightPolicy::None, &params), vec![0.0, 10.0, 500.0, 2000.0]);
        assert_eq!(compute_weights(&sizes, WeightPolicy::Equal, &params), vec![0.0, 1.0, 1.0, 1.0]);
        assert_eq!(compute_weights(&sizes, WeightPolicy::Variable, &params), vec![0.0, 0.01, 0.5, 1.0]);

        let ramp = VariableWeightParameters { lower_bound: 20.0, upper_bound: 120.0 };
        assert_eq!(compute_variable_weight(10.0, &ramp), 0.0);
        assert_eq!(compute_variable_weight(70.0, &ramp), 0.5);
        assert_eq!(compute_variable_weight(120.0, &ramp), 1.0);

        // degenerate ramp: any non‑empty block gets full weight
        let flat = VariableWeightParameters { lower_bound: 0.0, upper_bound: 0.0 };
        assert_eq!(compute_weights(&sizes, WeightPolicy::Variable, &flat), vec![0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn weighted_average() {
        let a = [1.0, 2.0, f64::NAN];
        let b = [3.0, 6.0, 1.0];
        let mut out = [0.0; 3];

        average_vectors_weighted(&[&a, &b], &[1.0, 3.0], &mut out).unwrap();
        assert_relative_eq!(out[0], 2.5);
        assert_relative_eq!(out[1], 5.0);
        assert!(out[2].is_nan());

        // zero weight drops the NaN
        average_vectors_weighted(&[&a, &b], &[0.0, 2.0], &mut out).unwrap();
        assert_eq!(out, [3.0, 6.0, 1.0]);

        average_vectors_weighted(&[&a, &b], &[0.0, 0.0], &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_nan()));
        average_vectors_weighted(&[], &[], &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_nan()));

        assert!(average_vectors_weighted(&[&a], &[1.0, 1.0], &mut out).is_err());
    }

    #[test]
    fn quantile_takes_lower_middle() {
        let a = [4.0, 1.0];
        let b = [1.0, f64::NAN];
        let c = [3.0, 2.0];
        let d = [2.0, 5.0];
        let mut out = [0.0; 2];

        quantile_vectors(&[&a, &b, &c], 0.5, &mut out).unwrap();
        assert_eq!(out, [3.0, 2.0]);

        // even count: lower of the two middle values
        quantile_vectors(&[&a, &b, &c, &d], 0.5, &mut out).unwrap();
        assert_eq!(out[0], 2.0);
        assert_eq!(out[1], 2.0);

        quantile_vectors(&[&a, &b, &c, &d], 0.0, &mut out).unwrap();
        assert_eq!(out, [1.0, 1.0]);
        quantile_vectors(&[&a, &b, &c, &d], 1.0, &mut out).unwrap();
        assert_eq!(out[0], 4.0);
        assert!(out[1].is_nan());

        assert!(quantile_vectors(&[&a], 1.5, &mut out).is_err());
        quantile_vectors(&[], 0.5, &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn partial_options_take_defaults() {
        let opt: AggregationOptions =
            serde_json::from_str(r#"{"block_weight_policy": "equal", "variable_weight_parameters": {"upper_bound": 50}}"#)
                .unwrap();
        assert_eq!(opt.block_weight_policy, WeightPolicy::Equal);
        assert_eq!(opt.variable_weight_parameters, VariableWeightParameters { lower_bound: 0.0, upper_bound: 50.0 });
        assert_eq!(opt.average_policy, AveragePolicy::Mean);
        assert_eq!(opt.num_threads, 1);
    }
}
