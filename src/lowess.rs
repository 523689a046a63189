//! lowess.rs  –  local linear smoother used for the mean–variance trend
//! ===================================================================
//! The trend fitter only talks to the [`Smoother`] trait, so any smoother
//! with the same contract can be swapped in:
//!
//! * `x` is sorted ascending, `y` is in the same order;
//! * one fitted value is written per point;
//! * the window either covers a proportion of the points, or at least
//!   `count` points *and* at least `width` along the x‑axis (the window is
//!   grown from the nearest neighbours until both hold).
//!
//! [`Lowess`] is the default: tricube‑weighted local linear fits, bisquare
//! robustness iterations and linear interpolation between anchor points
//! that are closer than `delta`.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use crate::error::{check_length, Result, VarianceError};

/// How wide each local window is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingWindow {
    /// Fraction of all points in each window.
    Proportion(f64),
    /// At least `count` points and at least `width` along x.
    MinimumWidth { width: f64, count: usize },
}

pub trait Smoother {
    fn smooth(&self, x: &[f64], y: &[f64], window: &SmoothingWindow, fitted: &mut [f64]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Lowess {
    pub iterations: usize,   // robustness iterations after the first fit (default 3)
    pub delta: Option<f64>,  // anchor spacing; None → 1% of the x range
}

impl Default for Lowess {
    fn default() -> Self {
        Self { iterations: 3, delta: None }
    }
}

impl Smoother for Lowess {
    fn smooth(&self, x: &[f64], y: &[f64], window: &SmoothingWindow, fitted: &mut [f64]) -> Result<()> {
        let n = x.len();
        check_length("y", y.len(), n)?;
        check_length("fitted", fitted.len(), n)?;

        let (span_points, half_width) = match *window {
            SmoothingWindow::Proportion(p) => {
                if !(p > 0.0) {
                    return Err(VarianceError::invalid_input(format!("span must be positive, got {p}")));
                }
                ((p * n as f64).ceil() as usize, 0.0)
            }
            SmoothingWindow::MinimumWidth { width, count } => (count, width.max(0.0) / 2.0),
        };
        if n == 0 {
            return Ok(());
        }
        let span_points = span_points.clamp(1, n);

        let range = x[n - 1] - x[0];
        let delta = self.delta.unwrap_or(0.01 * range);
        let anchors = find_anchors(x, delta);
        let windows: Vec<Window> = anchors
            .iter()
            .map(|&a| find_window(x, a, span_points, half_width))
            .collect();

        let mean_abs_y = y.iter().map(|v| v.abs()).sum::<f64>() / n as f64;
        let mut robust = vec![1.0; n];
        let mut resid = vec![0.0; n];

        for it in 0..=self.iterations {
            for (&a, win) in anchors.iter().zip(&windows) {
                fitted[a] = fit_point(x, y, &robust, a, win, range);
            }
            interpolate(x, &anchors, fitted);

            if it == self.iterations {
                break;
            }

            // ---- bisquare robustness weights
            for ((r, &yi), &fi) in resid.iter_mut().zip(y).zip(fitted.iter()) {
                *r = (yi - fi).abs();
            }
            let cmad = 6.0 * median(&resid);
            if !(cmad > 1e-7 * mean_abs_y) {
                break;
            }
            for (w, &r) in robust.iter_mut().zip(&resid) {
                let u = r / cmad;
                *w = if u < 1.0 { (1.0 - u * u).powi(2) } else { 0.0 };
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// helpers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Window {
    pub left: usize,
    pub right: usize,   // inclusive
    pub radius: f64,
}

/// Points at which a local regression is actually computed.  Everything in
/// between is interpolated; ties share the fit of their anchor.
fn find_anchors(x: &[f64], delta: f64) -> Vec<usize> {
    let n = x.len();
    let mut anchors = vec![0];
    let mut last = 0;
    loop {
        let mut next = last + 1;
        while next < n && x[next] == x[last] {
            next += 1;
        }
        if next >= n {
            break;
        }
        let limit = x[last] + delta;
        let mut j = next;
        while j + 1 < n && x[j + 1] <= limit {
            j += 1;
        }
        anchors.push(j);
        last = j;
    }
    anchors
}

/// Nearest `span_points` neighbours of point `i`, then grown to take in
/// every point within `max(radius, half_width)`, boundary ties included.
pub(crate) fn find_window(x: &[f64], i: usize, span_points: usize, half_width: f64) -> Window {
    let n = x.len();
    let (mut left, mut right) = (i, i);
    while right - left + 1 < span_points {
        if left == 0 {
            right += 1;
        } else if right == n - 1 {
            left -= 1;
        } else if x[i] - x[left - 1] <= x[right + 1] - x[i] {
            left -= 1;
        } else {
            right += 1;
        }
    }

    let limit = (x[i] - x[left]).max(x[right] - x[i]).max(half_width);
    while left > 0 && x[i] - x[left - 1] <= limit {
        left -= 1;
    }
    while right + 1 < n && x[right + 1] - x[i] <= limit {
        right += 1;
    }

    let radius = (x[i] - x[left]).max(x[right] - x[i]);
    Window { left, right, radius }
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u * u;
        t * t * t
    }
}

fn fit_point(x: &[f64], y: &[f64], robust: &[f64], i: usize, win: &Window, range: f64) -> f64 {
    let fit = |use_robust: bool| -> Option<f64> {
        let xi = x[i];
        let weight = |j: usize| {
            let w = if win.radius > 0.0 { tricube((x[j] - xi).abs() / win.radius) } else { 1.0 };
            if use_robust { w * robust[j] } else { w }
        };

        let (mut sw, mut sx, mut sy) = (0.0, 0.0, 0.0);
        for j in win.left..=win.right {
            let w = weight(j);
            sw += w;
            sx += w * x[j];
            sy += w * y[j];
        }
        if !(sw > 0.0) {
            return None;
        }
        let (xbar, ybar) = (sx / sw, sy / sw);

        let (mut sxx, mut sxy) = (0.0, 0.0);
        for j in win.left..=win.right {
            let w = weight(j);
            let dx = x[j] - xbar;
            sxx += w * dx * dx;
            sxy += w * dx * (y[j] - ybar);
        }

        // no spread in x: local constant
        if sxx.sqrt() <= 1e-3 * range * sw.sqrt() {
            return Some(ybar);
        }
        Some(ybar + sxy / sxx * (xi - xbar))
    };

    fit(true).or_else(|| fit(false)).unwrap_or(y[i])
}

fn interpolate(x: &[f64], anchors: &[usize], fitted: &mut [f64]) {
    for pair in anchors.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let span = x[b] - x[a];
        for i in a + 1..b {
            fitted[i] = if x[i] == x[b] {
                fitted[b]
            } else if span > 0.0 {
                fitted[a] + (x[i] - x[a]) / span * (fitted[b] - fitted[a])
            } else {
                fitted[a]
            };
        }
    }
    if let Some(&last) = anchors.last() {
        for i in last + 1..x.len() {
            fitted[i] = fitted[last];
        }
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    (sorted[(n - 1) / 2] + sorted[n / 2]) / 2.0
}
