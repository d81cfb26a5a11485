//! Incomplete LU factorization used as a preconditioner.
//!
//! The factorization is ILU(0): the factors share the sparsity pattern of the input matrix,
//! so no fill-in is created. In addition, off-diagonal entries that are small relative to the
//! norm of their row in the input matrix are dropped (set to zero) during the factorization.
//!
//! Rows whose diagonal is missing or vanishes, such as the constraint rows of a saddle point
//! system, are statically pivoted before factoring: such a row `i` trades places with a row `j`
//! for which both `a_ij` and `a_ji` are nonzero. The factors then approximate `P A`, where `P`
//! is the resulting row permutation, and the solves apply `P` (or `P^T`) accordingly.
use crate::gmres::{LinearOperator, Transpose};
use crate::Real;
use core::fmt;
use log::trace;
use nalgebra::{DVectorView, DVectorViewMut};
use nalgebra_sparse::CsrMatrix;
use std::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FactorizationError {
    NotSquare { nrows: usize, ncols: usize },
    /// The sparsity pattern does not store the diagonal entry of the given row.
    MissingDiagonal { row: usize },
    /// The pivot of the given row vanished or became non-finite during elimination.
    ///
    /// The row index refers to the matrix after its row exchanges.
    ZeroPivot { row: usize },
}

impl fmt::Display for FactorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSquare { nrows, ncols } => {
                write!(f, "cannot factor non-square {}x{} matrix", nrows, ncols)
            }
            Self::MissingDiagonal { row } => {
                write!(f, "sparsity pattern has no diagonal entry in row {}", row)
            }
            Self::ZeroPivot { row } => write!(f, "zero pivot encountered in row {}", row),
        }
    }
}

impl Error for FactorizationError {}

/// Incomplete LU factors `A ≈ L U` stored in a single CSR matrix.
///
/// The strictly lower triangular part holds `L` (whose unit diagonal is implicit),
/// the upper triangular part including the diagonal holds `U`. The factors belong to the
/// input matrix with the rows of every pair in [`row_swaps`](Self::row_swaps) exchanged.
#[derive(Debug, Clone)]
pub struct IncompleteLu<T> {
    factors: CsrMatrix<T>,
    diagonal: Vec<usize>,
    row_swaps: Vec<(usize, usize)>,
}

fn entry<T: Real>(matrix: &CsrMatrix<T>, i: usize, j: usize) -> T {
    matrix
        .get_entry(i, j)
        .map(|entry| entry.into_value())
        .unwrap_or_else(T::zero)
}

/// Pairs every row with a negligible diagonal with a row it can exchange places with.
///
/// The swaps are disjoint, so the permutation they describe is its own inverse.
fn find_row_swaps<T: Real>(matrix: &CsrMatrix<T>, row_norms: &[T], floor: T) -> Vec<(usize, usize)> {
    let n = matrix.nrows();
    let mut swapped = vec![false; n];
    let mut swaps = Vec::new();
    for i in 0..n {
        if swapped[i] || entry(matrix, i, i).abs() > floor * row_norms[i] {
            continue;
        }

        let row = matrix.row(i);
        let mut best: Option<(usize, T)> = None;
        for (&j, &a_ij) in row.col_indices().iter().zip(row.values()) {
            if j == i || swapped[j] {
                continue;
            }
            // Both new diagonals must be usable
            let strength = a_ij.abs().min(entry(matrix, j, i).abs());
            let threshold = floor * row_norms[i].max(row_norms[j]);
            if strength > threshold && best.map_or(true, |(_, s)| strength > s) {
                best = Some((j, strength));
            }
        }

        if let Some((j, _)) = best {
            swapped[i] = true;
            swapped[j] = true;
            swaps.push((i.min(j), i.max(j)));
        }
    }
    swaps
}

fn swap_rows<T: Real>(matrix: &CsrMatrix<T>, swaps: &[(usize, usize)]) -> CsrMatrix<T> {
    let mut source: Vec<usize> = (0..matrix.nrows()).collect();
    for &(i, j) in swaps {
        source.swap(i, j);
    }

    let mut offsets = Vec::with_capacity(matrix.nrows() + 1);
    let mut col_indices = Vec::with_capacity(matrix.nnz());
    let mut values = Vec::with_capacity(matrix.nnz());
    offsets.push(0);
    for row in source {
        let lane = matrix.row(row);
        col_indices.extend_from_slice(lane.col_indices());
        values.extend_from_slice(lane.values());
        offsets.push(col_indices.len());
    }
    CsrMatrix::try_from_csr_data(matrix.nrows(), matrix.ncols(), offsets, col_indices, values)
        .expect("Exchanging rows preserves a valid CSR layout")
}

impl<T: Real> IncompleteLu<T> {
    /// Factors `matrix`, dropping off-diagonal entries of magnitude below
    /// `drop_tolerance * ||a_i||`, where `a_i` is the corresponding row of `matrix`.
    pub fn factor(matrix: &CsrMatrix<T>, drop_tolerance: T) -> Result<Self, FactorizationError> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(FactorizationError::NotSquare {
                nrows: n,
                ncols: matrix.ncols(),
            });
        }

        let mut row_norms: Vec<T> = matrix
            .row_iter()
            .map(|row| row.values().iter().fold(T::zero(), |acc, v| acc + *v * *v).sqrt())
            .collect();
        let pivot_floor: T = nalgebra::convert(f64::EPSILON);

        let row_swaps = find_row_swaps(matrix, &row_norms, pivot_floor);
        let mut factors = if row_swaps.is_empty() {
            matrix.clone()
        } else {
            for &(i, j) in &row_swaps {
                row_norms.swap(i, j);
            }
            swap_rows(matrix, &row_swaps)
        };
        let (offsets, cols, values) = factors.csr_data_mut();

        let mut diagonal = Vec::with_capacity(n);
        for i in 0..n {
            let row_cols = &cols[offsets[i]..offsets[i + 1]];
            match row_cols.binary_search(&i) {
                Ok(local) => diagonal.push(offsets[i] + local),
                Err(_) => return Err(FactorizationError::MissingDiagonal { row: i }),
            }
        }

        // Maps a column index to the position of that column in the row currently being eliminated
        let mut position = vec![usize::MAX; n];

        for i in 0..n {
            let (start, end) = (offsets[i], offsets[i + 1]);
            let threshold = drop_tolerance * row_norms[i];
            for idx in start..end {
                position[cols[idx]] = idx;
            }

            for idx in start..diagonal[i] {
                let k = cols[idx];
                let l_ik = values[idx] / values[diagonal[k]];
                if l_ik.abs() < threshold {
                    values[idx] = T::zero();
                    continue;
                }
                values[idx] = l_ik;
                for kj in (diagonal[k] + 1)..offsets[k + 1] {
                    let p = position[cols[kj]];
                    if p != usize::MAX {
                        let u_kj = values[kj];
                        values[p] -= l_ik * u_kj;
                    }
                }
            }

            for idx in (diagonal[i] + 1)..end {
                if values[idx].abs() < threshold {
                    values[idx] = T::zero();
                }
            }

            let pivot = values[diagonal[i]];
            if !pivot.is_finite() || pivot.abs() <= pivot_floor * row_norms[i] || pivot == T::zero() {
                return Err(FactorizationError::ZeroPivot { row: i });
            }

            for idx in start..end {
                position[cols[idx]] = usize::MAX;
            }
        }

        if !row_swaps.is_empty() {
            trace!("Incomplete LU exchanged {} row pairs to obtain usable pivots", row_swaps.len());
        }
        Ok(Self {
            factors,
            diagonal,
            row_swaps,
        })
    }
}

impl<T> IncompleteLu<T> {
    /// The combined `L` and `U` factors.
    pub fn factors(&self) -> &CsrMatrix<T> {
        &self.factors
    }

    pub fn dim(&self) -> usize {
        self.diagonal.len()
    }

    /// Disjoint pairs of rows that were exchanged before factoring.
    pub fn row_swaps(&self) -> &[(usize, usize)] {
        &self.row_swaps
    }
}

impl<T: Real> IncompleteLu<T> {
    /// Solves `L U y = P y` in place.
    pub fn solve_in_place(&self, mut y: DVectorViewMut<T>) {
        for &(i, j) in &self.row_swaps {
            y.swap_rows(i, j);
        }

        let offsets = self.factors.row_offsets();
        let cols = self.factors.col_indices();
        let values = self.factors.values();
        let n = self.dim();
        assert_eq!(y.len(), n, "Vector dimension must match factorization dimension");

        for i in 0..n {
            let mut y_i = y[i];
            for idx in offsets[i]..self.diagonal[i] {
                y_i -= values[idx] * y[cols[idx]];
            }
            y[i] = y_i;
        }

        for i in (0..n).rev() {
            let mut y_i = y[i];
            for idx in (self.diagonal[i] + 1)..offsets[i + 1] {
                y_i -= values[idx] * y[cols[idx]];
            }
            y[i] = y_i / values[self.diagonal[i]];
        }
    }

    /// Solves `(P^T L U)^T y = U^T L^T P y = y` in place.
    pub fn solve_transpose_in_place(&self, mut y: DVectorViewMut<T>) {
        let offsets = self.factors.row_offsets();
        let cols = self.factors.col_indices();
        let values = self.factors.values();
        let n = self.dim();
        assert_eq!(y.len(), n, "Vector dimension must match factorization dimension");

        // U^T is lower triangular: eliminate column-wise through the rows of U
        for i in 0..n {
            let y_i = y[i] / values[self.diagonal[i]];
            y[i] = y_i;
            for idx in (self.diagonal[i] + 1)..offsets[i + 1] {
                let j = cols[idx];
                y[j] -= values[idx] * y_i;
            }
        }

        // L^T is unit upper triangular
        for i in (0..n).rev() {
            let y_i = y[i];
            for idx in offsets[i]..self.diagonal[i] {
                let k = cols[idx];
                y[k] -= values[idx] * y_i;
            }
        }

        for &(i, j) in &self.row_swaps {
            y.swap_rows(i, j);
        }
    }
}

impl<T: Real> LinearOperator<T> for IncompleteLu<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        y.copy_from(&x);
        self.solve_in_place(y);
        Ok(())
    }
}

impl<'a, T: Real> LinearOperator<T> for Transpose<&'a IncompleteLu<T>> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        y.copy_from(&x);
        self.0.solve_transpose_in_place(y);
        Ok(())
    }
}
