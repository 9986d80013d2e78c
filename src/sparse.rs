use core::fmt;

use faer_core::sparse::mul::{dense_sparse_matmul, sparse_dense_matmul};
use faer_core::sparse::{CreationError, SparseColMat, SparseColMatRef, SymbolicSparseColMat};
use faer_core::{mat, Parallelism};
use ndarray::Array2;

/// Column-compressed sparse linear operator.
///
/// Indices are zero-based; each column's row indices are sorted and unique.
/// Every operator in the forward model (PSF, translations, constraint
/// blocks) is stored in this form, backed by a faer `SparseColMat`.
#[derive(Debug, Clone)]
pub struct SparseOp {
    mat: SparseColMat<usize, f64>,
}

/// Validation errors for a SparseOp.
#[derive(Debug, Clone, PartialEq)]
pub enum SparseError {
    /// col_ptrs length is not ncols + 1.
    ColPtrLen { expected: usize, actual: usize },
    /// col_ptrs[0] is not 0.
    ColPtrStart { value: usize },
    /// col_ptrs is not non-decreasing.
    ColPtrNotMonotonic { col: usize, prev: usize, next: usize },
    /// col_ptrs[ncols] does not match row_indices length.
    ColPtrOutOfBounds { last: usize, row_indices_len: usize },
    /// A row index is >= nrows.
    RowIndexOutOfBounds { col: usize, row: usize, nrows: usize },
    /// Row indices in a column are not sorted.
    RowIndexNotSorted { col: usize, prev: usize, next: usize },
    /// values length does not match row_indices length.
    ValuesLen { expected: usize, actual: usize },
    /// A triplet lies outside the matrix.
    TripletOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
    /// faer could not allocate or index the assembled structure.
    Allocation,
    /// Inner dimensions of a product do not agree.
    ProductMismatch { lhs_ncols: usize, rhs_nrows: usize },
}

impl fmt::Display for SparseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColPtrLen { expected, actual } => {
                write!(f, "col_ptrs length {actual} does not match expected {expected}")
            }
            Self::ColPtrStart { value } => {
                write!(f, "col_ptrs must start at 0 (got {value})")
            }
            Self::ColPtrNotMonotonic { col, prev, next } => {
                write!(f, "col_ptrs not monotonic at col {col}: {prev} > {next}")
            }
            Self::ColPtrOutOfBounds {
                last,
                row_indices_len,
            } => {
                write!(
                    f,
                    "col_ptrs end {last} does not match row_indices length {row_indices_len}"
                )
            }
            Self::RowIndexOutOfBounds { col, row, nrows } => {
                write!(f, "row index {row} in col {col} exceeds nrows {nrows}")
            }
            Self::RowIndexNotSorted { col, prev, next } => {
                write!(f, "row indices not sorted in col {col}: {prev} >= {next}")
            }
            Self::ValuesLen { expected, actual } => {
                write!(f, "values length {actual} does not match expected {expected}")
            }
            Self::TripletOutOfBounds {
                row,
                col,
                nrows,
                ncols,
            } => {
                write!(f, "entry ({row},{col}) outside a {nrows}x{ncols} operator")
            }
            Self::Allocation => write!(f, "sparse structure could not be allocated"),
            Self::ProductMismatch {
                lhs_ncols,
                rhs_nrows,
            } => {
                write!(
                    f,
                    "cannot multiply: lhs has {lhs_ncols} columns, rhs has {rhs_nrows} rows"
                )
            }
        }
    }
}

impl std::error::Error for SparseError {}

impl PartialEq for SparseOp {
    fn eq(&self, other: &Self) -> bool {
        self.nrows() == other.nrows()
            && self.ncols() == other.ncols()
            && self.col_ptrs() == other.col_ptrs()
            && self.row_indices() == other.row_indices()
            && self.values() == other.values()
    }
}

impl SparseOp {
    /// Creates a validated column-compressed operator.
    ///
    /// Requirements:
    /// - `col_ptrs.len() == ncols + 1`
    /// - `col_ptrs` is non-decreasing and starts at `0`
    /// - `col_ptrs[ncols] == row_indices.len() == values.len()`
    /// - row indices are strictly increasing and `< nrows` within each column
    pub fn new(
        nrows: usize,
        ncols: usize,
        col_ptrs: Vec<usize>,
        row_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, SparseError> {
        let expected = ncols + 1;
        if col_ptrs.len() != expected {
            return Err(SparseError::ColPtrLen {
                expected,
                actual: col_ptrs.len(),
            });
        }
        if col_ptrs[0] != 0 {
            return Err(SparseError::ColPtrStart {
                value: col_ptrs[0],
            });
        }
        for col in 0..ncols {
            let prev = col_ptrs[col];
            let next = col_ptrs[col + 1];
            if prev > next {
                return Err(SparseError::ColPtrNotMonotonic { col, prev, next });
            }
        }
        let last = col_ptrs[ncols];
        if last != row_indices.len() {
            return Err(SparseError::ColPtrOutOfBounds {
                last,
                row_indices_len: row_indices.len(),
            });
        }
        if values.len() != row_indices.len() {
            return Err(SparseError::ValuesLen {
                expected: row_indices.len(),
                actual: values.len(),
            });
        }

        for col in 0..ncols {
            let rows = &row_indices[col_ptrs[col]..col_ptrs[col + 1]];
            for (i, &row) in rows.iter().enumerate() {
                if row >= nrows {
                    return Err(SparseError::RowIndexOutOfBounds { col, row, nrows });
                }
                if i > 0 && rows[i - 1] >= row {
                    return Err(SparseError::RowIndexNotSorted {
                        col,
                        prev: rows[i - 1],
                        next: row,
                    });
                }
            }
        }

        Ok(Self::from_sorted(nrows, ncols, col_ptrs, row_indices, values))
    }

    /// Wraps compressed arrays already known to be valid.
    fn from_sorted(
        nrows: usize,
        ncols: usize,
        col_ptrs: Vec<usize>,
        row_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        let symbolic = SymbolicSparseColMat::new_checked(nrows, ncols, col_ptrs, None, row_indices);
        Self {
            mat: SparseColMat::new(symbolic, values),
        }
    }

    /// Builds an operator from `(row, col, value)` entries; duplicates are summed.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self, SparseError> {
        SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
            .map(|mat| Self { mat })
            .map_err(|err| match err {
                CreationError::OutOfBounds { row, col } => SparseError::TripletOutOfBounds {
                    row,
                    col,
                    nrows,
                    ncols,
                },
                _ => SparseError::Allocation,
            })
    }

    /// The n x n identity.
    pub fn identity(n: usize) -> Self {
        Self::from_sorted(n, n, (0..=n).collect(), (0..n).collect(), vec![1.0; n])
    }

    /// The n x n operator without stored entries.
    pub fn zeros(n: usize) -> Self {
        Self::from_sorted(n, n, vec![0; n + 1], Vec::new(), Vec::new())
    }

    pub fn nrows(&self) -> usize {
        self.mat.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.mat.ncols()
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.mat.compute_nnz()
    }

    pub fn col_ptrs(&self) -> &[usize] {
        self.mat.col_ptrs()
    }

    pub fn row_indices(&self) -> &[usize] {
        self.mat.row_indices()
    }

    pub fn values(&self) -> &[f64] {
        self.mat.values()
    }

    pub fn row_indices_of_col(&self, col: usize) -> &[usize] {
        self.mat.row_indices_of_col_raw(col)
    }

    pub fn values_of_col(&self, col: usize) -> &[f64] {
        self.as_faer().values_of_col(col)
    }

    /// Computes `self * x`.
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.nrows()];
        self.mul_vec_into(1.0, x, &mut out);
        out
    }

    /// Accumulates `out += alpha * self * x`.
    ///
    /// Panics if `x` or `out` do not match the operator's shape.
    pub fn mul_vec_into(&self, alpha: f64, x: &[f64], out: &mut [f64]) {
        let rhs = mat::from_column_major_slice::<f64>(x, x.len(), 1);
        let acc = mat::from_column_major_slice_mut::<f64>(out, out.len(), 1);
        sparse_dense_matmul(acc, self.as_faer(), rhs, Some(1.0), alpha, Parallelism::None);
    }

    /// Accumulates `out += alpha * self^T * x`.
    ///
    /// Evaluated as the row product `x^T * self`.
    pub fn transpose_mul_vec_into(&self, alpha: f64, x: &[f64], out: &mut [f64]) {
        let lhs = mat::from_column_major_slice::<f64>(x, 1, x.len());
        let acc = mat::from_column_major_slice_mut::<f64>(out, 1, out.len());
        dense_sparse_matmul(acc, lhs, self.as_faer(), Some(1.0), alpha, Parallelism::None);
    }

    /// Computes `self^T * x`.
    pub fn transpose_mul_vec(&self, x: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.ncols()];
        self.transpose_mul_vec_into(1.0, x, &mut out);
        out
    }

    /// Sparse product `self * rhs`.
    ///
    /// faer-core has no sparse-sparse product, so this is a column-wise
    /// scatter (Gustavson).
    pub fn matmul(&self, rhs: &SparseOp) -> Result<SparseOp, SparseError> {
        if self.ncols() != rhs.nrows() {
            return Err(SparseError::ProductMismatch {
                lhs_ncols: self.ncols(),
                rhs_nrows: rhs.nrows(),
            });
        }

        let nrows = self.nrows();
        let mut accum = vec![0.0; nrows];
        let mut touched = vec![false; nrows];
        let mut pattern: Vec<usize> = Vec::new();

        let mut col_ptrs = Vec::with_capacity(rhs.ncols() + 1);
        let mut row_indices = Vec::new();
        let mut values = Vec::new();
        col_ptrs.push(0);

        for col in 0..rhs.ncols() {
            for (&inner, &scale) in rhs.row_indices_of_col(col).iter().zip(rhs.values_of_col(col)) {
                for (&row, &value) in self.row_indices_of_col(inner).iter().zip(self.values_of_col(inner)) {
                    if !touched[row] {
                        touched[row] = true;
                        pattern.push(row);
                    }
                    accum[row] += value * scale;
                }
            }
            pattern.sort_unstable();
            for &row in &pattern {
                row_indices.push(row);
                values.push(accum[row]);
                accum[row] = 0.0;
                touched[row] = false;
            }
            pattern.clear();
            col_ptrs.push(row_indices.len());
        }

        Ok(Self::from_sorted(nrows, rhs.ncols(), col_ptrs, row_indices, values))
    }

    /// Block-diagonal concatenation of `blocks`, in order.
    pub fn block_diag(blocks: &[&SparseOp]) -> SparseOp {
        let nrows = blocks.iter().map(|b| b.nrows()).sum();
        let ncols = blocks.iter().map(|b| b.ncols()).sum();
        let nnz = blocks.iter().map(|b| b.nnz()).sum();

        let mut col_ptrs = Vec::with_capacity(ncols + 1);
        let mut row_indices = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        col_ptrs.push(0);

        let mut row_offset = 0;
        for block in blocks {
            for col in 0..block.ncols() {
                row_indices.extend(block.row_indices_of_col(col).iter().map(|r| r + row_offset));
                values.extend_from_slice(block.values_of_col(col));
                col_ptrs.push(row_indices.len());
            }
            row_offset += block.nrows();
        }

        Self::from_sorted(nrows, ncols, col_ptrs, row_indices, values)
    }

    /// Drops entries whose magnitude is below `rel` times the largest magnitude.
    pub fn thresholded(&self, rel: f64) -> SparseOp {
        let max = self.values().iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let cutoff = rel * max;

        let mut col_ptrs = Vec::with_capacity(self.ncols() + 1);
        let mut row_indices = Vec::with_capacity(self.nnz());
        let mut values = Vec::with_capacity(self.nnz());
        col_ptrs.push(0);
        for col in 0..self.ncols() {
            for (&row, &value) in self.row_indices_of_col(col).iter().zip(self.values_of_col(col)) {
                if value != 0.0 && value.abs() >= cutoff {
                    row_indices.push(row);
                    values.push(value);
                }
            }
            col_ptrs.push(row_indices.len());
        }

        Self::from_sorted(self.nrows(), self.ncols(), col_ptrs, row_indices, values)
    }

    /// Estimate of the squared spectral norm `||self||_2^2` by power iteration on `self^T self`.
    pub fn spectral_norm_sq(&self, iters: usize) -> f64 {
        if self.nnz() == 0 || self.ncols() == 0 {
            return 0.0;
        }
        // A ramp start avoids the symmetric null space of mirror operators.
        let mut x: Vec<f64> = (1..=self.ncols()).map(|i| i as f64).collect();
        let start = x.iter().map(|v| v * v).sum::<f64>().sqrt();
        x.iter_mut().for_each(|v| *v /= start);
        let mut estimate = 0.0;
        for _ in 0..iters.max(1) {
            let y = self.mul_vec(&x);
            let z = self.transpose_mul_vec(&y);
            let norm = z.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm == 0.0 {
                return 0.0;
            }
            estimate = norm;
            for (xi, zi) in x.iter_mut().zip(z.iter()) {
                *xi = zi / norm;
            }
        }
        estimate
    }

    /// Dense copy, rows by columns.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.nrows(), self.ncols()));
        for col in 0..self.ncols() {
            for (&row, &value) in self.row_indices_of_col(col).iter().zip(self.values_of_col(col)) {
                dense[[row, col]] += value;
            }
        }
        dense
    }

    /// Borrowed faer view of the operator.
    pub fn as_faer(&self) -> SparseColMatRef<'_, usize, f64> {
        self.mat.as_ref()
    }
}
