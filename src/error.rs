//! error.rs  –  crate‑wide error type
//! ==================================
//! Only genuine precondition failures end up here.  Degenerate blocks
//! (0 or 1 cells) are *not* errors: they produce NaN and are gated out
//! of the cross‑block averages.
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VarianceError {
    /// Fewer than two genes survived the mean filter, nothing to smooth.
    #[error("not enough observations above the minimum mean (found {found}, need at least 2)")]
    InsufficientObservations { found: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl VarianceError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VarianceError>;

/// Shared length check for caller‑supplied buffers.
pub(crate) fn check_length(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(VarianceError::invalid_input(format!(
            "length({what})={actual} != {expected}"
        )));
    }
    Ok(())
}
