//! matrix.rs  –  read‑only access to a genes × cells expression matrix
//! ===================================================================
//! The statistics kernels only need four things from a matrix:
//! * its dimensions,
//! * whether rows (genes) or columns (cells) are the cheap axis,
//! * whether it is sparse,
//! * one row / one column slice at a time, either as dense values or as
//!   (value, index) pairs.
//!
//! Adapters are provided for `sprs::CsMat<f64>` (CSR → rows preferred,
//! CSC → columns preferred) and any 2‑D `ndarray` (columns preferred only
//! when the array is Fortran‑contiguous).
//!
//! © 2025 Scott Furlan – MIT OR Apache‑2.0.

use ndarray::{s, ArrayBase, Data, Ix2};
use sprs::CsMat;

/// Non‑zero entries of one row or column.  Indices are absolute and are
/// not guaranteed to be sorted.
#[derive(Debug, Clone, Copy)]
pub struct SparseRange<'a> {
    pub value: &'a [f64],
    pub index: &'a [usize],
}

impl SparseRange<'_> {
    pub fn number(&self) -> usize {
        self.value.len()
    }
}

/// Genes in rows, cells in columns.
pub trait ExpressionMatrix: Sync {
    fn nrow(&self) -> usize;
    fn ncol(&self) -> usize;
    fn prefer_rows(&self) -> bool;
    fn is_sparse(&self) -> bool;

    /// Dense values of row `r` (length `ncol`).
    fn fetch_row<'a>(&'a self, r: usize, buffer: &'a mut Vec<f64>) -> &'a [f64];

    /// Dense values of rows `[start, start + length)` in column `c`.
    fn fetch_column<'a>(
        &'a self,
        c: usize,
        start: usize,
        length: usize,
        buffer: &'a mut Vec<f64>,
    ) -> &'a [f64];

    fn fetch_sparse_row<'a>(
        &'a self,
        r: usize,
        values: &'a mut Vec<f64>,
        indices: &'a mut Vec<usize>,
    ) -> SparseRange<'a> {
        let mut dense = Vec::new();
        let row = self.fetch_row(r, &mut dense);
        collect_nonzero(row, 0, values, indices);
        SparseRange { value: &values[..], index: &indices[..] }
    }

    fn fetch_sparse_column<'a>(
        &'a self,
        c: usize,
        start: usize,
        length: usize,
        values: &'a mut Vec<f64>,
        indices: &'a mut Vec<usize>,
    ) -> SparseRange<'a> {
        let mut dense = Vec::new();
        let col = self.fetch_column(c, start, length, &mut dense);
        collect_nonzero(col, start, values, indices);
        SparseRange { value: &values[..], index: &indices[..] }
    }
}

fn collect_nonzero(dense: &[f64], offset: usize, values: &mut Vec<f64>, indices: &mut Vec<usize>) {
    values.clear();
    indices.clear();
    for (i, &v) in dense.iter().enumerate() {
        if v != 0.0 {
            values.push(v);
            indices.push(i + offset);
        }
    }
}

//=========================================================================//
//  ndarray (dense)                                                        //
//=========================================================================//

impl<S> ExpressionMatrix for ArrayBase<S, Ix2>
where
    S: Data<Elem = f64> + Sync,
{
    fn nrow(&self) -> usize {
        self.nrows()
    }

    fn ncol(&self) -> usize {
        self.ncols()
    }

    fn prefer_rows(&self) -> bool {
        // F‑contiguous (and not trivially C‑contiguous) → walk columns
        self.is_standard_layout() || !self.t().is_standard_layout()
    }

    fn is_sparse(&self) -> bool {
        false
    }

    fn fetch_row<'a>(&'a self, r: usize, buffer: &'a mut Vec<f64>) -> &'a [f64] {
        let row = self.row(r);
        match row.to_slice() {
            Some(slice) => slice,
            None => {
                buffer.clear();
                buffer.extend(row.iter().copied());
                &buffer[..]
            }
        }
    }

    fn fetch_column<'a>(
        &'a self,
        c: usize,
        start: usize,
        length: usize,
        buffer: &'a mut Vec<f64>,
    ) -> &'a [f64] {
        let col = self.slice(s![start..start + length, c]);
        match col.to_slice() {
            Some(slice) => slice,
            None => {
                buffer.clear();
                buffer.extend(col.iter().copied());
                &buffer[..]
            }
        }
    }
}

//=========================================================================//
//  sprs::CsMat (CSR / CSC)                                                //
//=========================================================================//

/// Raw (indices, data) of one outer slice, borrowed from the matrix.
fn outer_slice(mat: &CsMat<f64>, i: usize) -> (&[usize], &[f64]) {
    let range = mat.indptr().outer_inds_sz(i);
    (&mat.indices()[range.clone()], &mat.data()[range])
}

/// Restrict a sorted inner index slice to `[start, start + length)`.
fn inner_window<'a>(
    idx: &'a [usize],
    val: &'a [f64],
    start: usize,
    length: usize,
) -> (&'a [usize], &'a [f64]) {
    let lo = idx.partition_point(|&i| i < start);
    let hi = idx.partition_point(|&i| i < start + length);
    (&idx[lo..hi], &val[lo..hi])
}

/// Look up a single inner index in a sorted outer slice.
fn lookup(idx: &[usize], val: &[f64], target: usize) -> Option<f64> {
    idx.binary_search(&target).ok().map(|k| val[k])
}

impl ExpressionMatrix for CsMat<f64> {
    fn nrow(&self) -> usize {
        self.rows()
    }

    fn ncol(&self) -> usize {
        self.cols()
    }

    fn prefer_rows(&self) -> bool {
        self.is_csr()
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn fetch_row<'a>(&'a self, r: usize, buffer: &'a mut Vec<f64>) -> &'a [f64] {
        let ncol = self.cols();
        buffer.clear();
        buffer.resize(ncol, 0.0);
        if self.is_csr() {
            let (idx, val) = outer_slice(self, r);
            for (&c, &v) in idx.iter().zip(val) {
                buffer[c] = v;
            }
        } else {
            for (c, slot) in buffer.iter_mut().enumerate() {
                let (idx, val) = outer_slice(self, c);
                if let Some(v) = lookup(idx, val, r) {
                    *slot = v;
                }
            }
        }
        &buffer[..]
    }

    fn fetch_column<'a>(
        &'a self,
        c: usize,
        start: usize,
        length: usize,
        buffer: &'a mut Vec<f64>,
    ) -> &'a [f64] {
        buffer.clear();
        buffer.resize(length, 0.0);
        if self.is_csr() {
            for (k, slot) in buffer.iter_mut().enumerate() {
                let (idx, val) = outer_slice(self, start + k);
                if let Some(v) = lookup(idx, val, c) {
                    *slot = v;
                }
            }
        } else {
            let (idx, val) = outer_slice(self, c);
            let (idx, val) = inner_window(idx, val, start, length);
            for (&r, &v) in idx.iter().zip(val) {
                buffer[r - start] = v;
            }
        }
        &buffer[..]
    }

    fn fetch_sparse_row<'a>(
        &'a self,
        r: usize,
        values: &'a mut Vec<f64>,
        indices: &'a mut Vec<usize>,
    ) -> SparseRange<'a> {
        if self.is_csr() {
            let (idx, val) = outer_slice(self, r);
            return SparseRange { value: val, index: idx };
        }
        values.clear();
        indices.clear();
        for c in 0..self.cols() {
            let (idx, val) = outer_slice(self, c);
            if let Some(v) = lookup(idx, val, r) {
                values.push(v);
                indices.push(c);
            }
        }
        SparseRange { value: &values[..], index: &indices[..] }
    }

    fn fetch_sparse_column<'a>(
        &'a self,
        c: usize,
        start: usize,
        length: usize,
        values: &'a mut Vec<f64>,
        indices: &'a mut Vec<usize>,
    ) -> SparseRange<'a> {
        if self.is_csc() {
            let (idx, val) = outer_slice(self, c);
            let (idx, val) = inner_window(idx, val, start, length);
            return SparseRange { value: val, index: idx };
        }
        values.clear();
        indices.clear();
        for r in start..start + length {
            let (idx, val) = outer_slice(self, r);
            if let Some(v) = lookup(idx, val, c) {
                values.push(v);
                indices.push(r);
            }
        }
        SparseRange { value: &values[..], index: &indices[..] }
    }
}
