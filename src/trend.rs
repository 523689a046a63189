//! trend.rs  –  mean–variance trend and residuals for one block
//! ============================================================
//! Pipeline (one pass, no retries):
//!
//! 1. drop genes with `mean < minimum_mean` (optional);
//! 2. quarter‑root the surviving variances (optional);
//! 3. remember the survivor with the smallest mean (the *left edge*);
//! 4. sort survivors by mean and smooth;
//! 5. un‑sort and undo the transform (`^4`);
//! 6. filtered genes get `mean / left_x * left_fitted`, i.e. a line through
//!    the origin and the left‑most fitted point;
//! 7. `residual = variance − fitted` for every gene.
//!
//! Fewer than two survivors is the only failure.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::{check_length, Result, VarianceError};
use crate::lowess::{Lowess, Smoother, SmoothingWindow};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendFitOptions {
    pub minimum_mean: f64,
    pub mean_filter: bool,
    pub transform: bool,
    pub span: f64,
    pub use_minimum_width: bool,
    pub minimum_width: f64,
    pub minimum_window_count: usize,
}

impl Default for TrendFitOptions {
    fn default() -> Self {
        Self {
            minimum_mean: 0.1,
            mean_filter: true,
            transform: true,
            span: 0.3,
            use_minimum_width: false,
            minimum_width: 1.0,
            minimum_window_count: 200,
        }
    }
}

impl TrendFitOptions {
    /// Window handed to the smoother.
    pub fn window(&self) -> SmoothingWindow {
        if self.use_minimum_width {
            SmoothingWindow::MinimumWidth { width: self.minimum_width, count: self.minimum_window_count }
        } else {
            SmoothingWindow::Proportion(self.span)
        }
    }
}

/// Scratch space kept alive across calls (one per block in the modeler).
#[derive(Debug, Default, Clone)]
pub struct TrendFitWorkspace {
    survivors: Vec<usize>,
    xs: Vec<f64>,
    ys: Vec<f64>,
    order: Vec<usize>,
    sorted_x: Vec<f64>,
    sorted_y: Vec<f64>,
    sorted_fit: Vec<f64>,
}

impl TrendFitWorkspace {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendFitResults {
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
}

/// Core routine with an injected smoother and reusable workspace.
pub fn fit_variance_trend_with<S: Smoother + ?Sized>(
    smoother: &S,
    workspace: &mut TrendFitWorkspace,
    mean: &[f64],
    variance: &[f64],
    fitted: &mut [f64],
    residuals: &mut [f64],
    options: &TrendFitOptions,
) -> Result<()> {
    let n = mean.len();
    check_length("variance", variance.len(), n)?;
    check_length("fitted", fitted.len(), n)?;
    check_length("residuals", residuals.len(), n)?;

    let forward = |v: f64| if options.transform { v.sqrt().sqrt() } else { v };
    let backward = |v: f64| if options.transform { (v * v) * (v * v) } else { v };

    let TrendFitWorkspace { survivors, xs, ys, order, sorted_x, sorted_y, sorted_fit } = workspace;

    // ---- 1–2. filter + transform
    survivors.clear();
    xs.clear();
    ys.clear();
    for (i, (&m, &v)) in mean.iter().zip(variance).enumerate() {
        if !options.mean_filter || m >= options.minimum_mean {
            survivors.push(i);
            xs.push(m);
            ys.push(forward(v));
        }
    }
    let found = survivors.len();
    trace!("{found} of {n} genes pass the mean filter");
    if found < 2 {
        return Err(VarianceError::InsufficientObservations { found });
    }

    // ---- 3. left edge (first minimum)
    let mut left = 0;
    for (j, &x) in xs.iter().enumerate().skip(1) {
        if x < xs[left] {
            left = j;
        }
    }

    // ---- 4. sort + smooth
    order.clear();
    order.extend(0..found);
    order.sort_by(|&a, &b| xs[a].total_cmp(&xs[b]));
    sorted_x.clear();
    sorted_x.extend(order.iter().map(|&j| xs[j]));
    sorted_y.clear();
    sorted_y.extend(order.iter().map(|&j| ys[j]));
    sorted_fit.clear();
    sorted_fit.resize(found, 0.0);
    smoother.smooth(sorted_x, sorted_y, &options.window(), sorted_fit)?;

    // ---- 5. un‑sort + inverse transform
    for (&j, &f) in order.iter().zip(sorted_fit.iter()) {
        fitted[survivors[j]] = backward(f);
    }

    // ---- 6. extrapolate below the filter
    if options.mean_filter {
        let left_x = xs[left];
        let left_fitted = fitted[survivors[left]];
        for (i, &m) in mean.iter().enumerate() {
            if !(m >= options.minimum_mean) {
                fitted[i] = m / left_x * left_fitted;
            }
        }
    }

    // ---- 7. residuals
    for ((r, &v), &f) in residuals.iter_mut().zip(variance).zip(fitted.iter()) {
        *r = v - f;
    }
    Ok(())
}

/// Fit with the default [`Lowess`] smoother into caller buffers.
pub fn fit_variance_trend(
    mean: &[f64],
    variance: &[f64],
    fitted: &mut [f64],
    residuals: &mut [f64],
    options: &TrendFitOptions,
) -> Result<()> {
    let mut workspace = TrendFitWorkspace::new();
    fit_variance_trend_with(&Lowess::default(), &mut workspace, mean, variance, fitted, residuals, options)
}

/// Allocating variant of [`fit_variance_trend`].
pub fn fit_variance_trend_results(
    mean: &[f64],
    variance: &[f64],
    options: &TrendFitOptions,
) -> Result<TrendFitResults> {
    let n = mean.len();
    let mut out = TrendFitResults { fitted: vec![0.0; n], residuals: vec![0.0; n] };
    fit_variance_trend(mean, variance, &mut out.fitted, &mut out.residuals, options)?;
    Ok(out)
}
