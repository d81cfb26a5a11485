//! Triplet (COO) buffers and their scatter into CSR matrices with a fixed sparsity pattern.
use core::fmt;
use itertools::izip;
use nalgebra::{ClosedAdd, DMatrix, Scalar};
use nalgebra_sparse::pattern::{SparsityPattern, SparsityPatternFormatError};
use nalgebra_sparse::CsrMatrix;
use num::Zero;
use std::collections::BTreeSet;
use std::error::Error;

/// Fixed-size triplet buffers describing a sparse matrix.
///
/// Duplicate `(row, col)` pairs are allowed and are summed when the triplets are converted.
#[derive(Debug, Clone, PartialEq)]
pub struct Triplets<T> {
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<T>,
}

impl<T: Scalar + Zero> Triplets<T> {
    pub fn zeros(nrows: usize, ncols: usize, nnz: usize) -> Self {
        Self {
            nrows,
            ncols,
            rows: vec![0; nnz],
            cols: vec![0; nnz],
            values: vec![T::zero(); nnz],
        }
    }
}

impl<T> Triplets<T> {
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of stored triplets, including duplicates.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Mutable access to the row indices, column indices and values.
    pub fn parts_mut(&mut self) -> (&mut [usize], &mut [usize], &mut [T]) {
        (&mut self.rows, &mut self.cols, &mut self.values)
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = (usize, usize, &T)> {
        izip!(&self.rows, &self.cols, &self.values).map(|(i, j, v)| (*i, *j, v))
    }
}

impl<T: Scalar + Zero + ClosedAdd> Triplets<T> {
    /// Builds a dense matrix, summing duplicate entries.
    pub fn to_dense(&self) -> DMatrix<T> {
        let mut result = DMatrix::zeros(self.nrows, self.ncols);
        for (i, j, v) in self.iter() {
            result[(i, j)] += v.clone();
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TripletError {
    IndexOutOfBounds { entry: usize, row: usize, col: usize },
    /// A structural diagonal was requested for a non-square matrix.
    NonSquareDiagonal { nrows: usize, ncols: usize },
    InvalidPattern(SparsityPatternFormatError),
}

impl fmt::Display for TripletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfBounds { entry, row, col } => {
                write!(f, "triplet {} at ({}, {}) is out of bounds", entry, row, col)
            }
            Self::NonSquareDiagonal { nrows, ncols } => {
                write!(f, "cannot add a diagonal to a {}x{} pattern", nrows, ncols)
            }
            Self::InvalidPattern(err) => write!(f, "invalid sparsity pattern: {}", err),
        }
    }
}

impl Error for TripletError {}

/// A precomputed map from triplet positions to CSR value slots.
///
/// The map is built once from the index arrays of a set of triplets. Afterwards, any value
/// array produced with the *same* index arrays can be scattered into a CSR matrix in place,
/// without touching the sparsity pattern.
#[derive(Debug, Clone)]
pub struct TripletScatter {
    pattern: SparsityPattern,
    rows: Vec<usize>,
    cols: Vec<usize>,
    targets: Vec<usize>,
}

impl TripletScatter {
    /// Discovers the sparsity pattern of the given triplets.
    ///
    /// If `include_diagonal` is set, the pattern additionally stores every diagonal entry,
    /// even where no triplet contributes to it.
    pub fn from_triplets<T>(triplets: &Triplets<T>, include_diagonal: bool) -> Result<Self, TripletError> {
        let (nrows, ncols) = (triplets.nrows(), triplets.ncols());
        if include_diagonal && nrows != ncols {
            return Err(TripletError::NonSquareDiagonal { nrows, ncols });
        }

        let mut entries = BTreeSet::new();
        for (entry, (i, j, _)) in triplets.iter().enumerate() {
            if i >= nrows || j >= ncols {
                return Err(TripletError::IndexOutOfBounds { entry, row: i, col: j });
            }
            entries.insert((i, j));
        }
        if include_diagonal {
            entries.extend((0..nrows).map(|i| (i, i)));
        }

        let mut offsets = Vec::with_capacity(nrows + 1);
        let mut column_indices = Vec::with_capacity(entries.len());
        offsets.push(0);
        for (i, j) in entries {
            // Consecutive empty rows need several offsets pushed at once
            while i + 1 > offsets.len() {
                offsets.push(column_indices.len());
            }
            column_indices.push(j);
        }
        while offsets.len() < nrows + 1 {
            offsets.push(column_indices.len());
        }

        let pattern = SparsityPattern::try_from_offsets_and_indices(nrows, ncols, offsets, column_indices)
            .map_err(TripletError::InvalidPattern)?;

        let targets = triplets
            .iter()
            .map(|(i, j, _)| {
                let begin = pattern.major_offsets()[i];
                let lane = pattern.lane(i);
                // Every triplet was inserted into the pattern above
                let local = lane.binary_search(&j).unwrap_or_else(|insert| insert);
                begin + local
            })
            .collect();

        Ok(Self {
            pattern,
            rows: triplets.rows().to_vec(),
            cols: triplets.cols().to_vec(),
            targets,
        })
    }

    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    pub fn nrows(&self) -> usize {
        self.pattern.major_dim()
    }

    pub fn ncols(&self) -> usize {
        self.pattern.minor_dim()
    }

    /// Number of triplets this map was built from.
    pub fn num_triplets(&self) -> usize {
        self.targets.len()
    }

    /// Returns the first triplet whose indices differ from the ones this map was built from.
    pub fn find_mismatch<T>(&self, triplets: &Triplets<T>) -> Option<usize> {
        if triplets.len() != self.num_triplets() {
            return Some(triplets.len().min(self.num_triplets()));
        }
        izip!(triplets.rows(), triplets.cols(), &self.rows, &self.cols)
            .position(|(i, j, i0, j0)| i != i0 || j != j0)
    }

    /// Creates a zero-valued CSR matrix with the discovered pattern.
    pub fn new_matrix<T: Scalar + Zero>(&self) -> CsrMatrix<T> {
        let values = vec![T::zero(); self.pattern.nnz()];
        CsrMatrix::try_from_pattern_and_values(self.pattern.clone(), values)
            .expect("Value count always matches the pattern")
    }

    /// Overwrites the values of `matrix` with the sum of the given triplet values.
    ///
    /// `values` must be ordered like the triplets this map was built from.
    pub fn scatter_into<T>(&self, matrix: &mut CsrMatrix<T>, values: &[T])
    where
        T: Scalar + Zero + ClosedAdd,
    {
        assert_eq!(values.len(), self.num_triplets(), "Value count must match triplet count");
        assert_eq!(
            matrix.nnz(),
            self.pattern.nnz(),
            "Matrix must have the pattern of the scatter map"
        );
        let matrix_values = matrix.values_mut();
        matrix_values.fill(T::zero());
        for (target, v) in self.targets.iter().zip(values) {
            matrix_values[*target] += v.clone();
        }
    }
}
