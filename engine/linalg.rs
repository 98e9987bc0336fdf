//! Small dense helpers shared by the estimator and the inference engine.
//!
//! Every routine here works on a single voxel's matrices. Failures never
//! surface as errors: a singular or non-finite input produces NaN output so
//! that one pathological voxel cannot stop the rest of the volume.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::{Determinant, Eigh, Inverse, SVD, Solve, UPLO};

fn all_finite(matrix: &ArrayView2<f64>) -> bool {
    matrix.iter().all(|value| value.is_finite())
}

/// Inverse of a square matrix, or `None` when it is singular or non-finite.
pub fn try_invert(matrix: &ArrayView2<f64>) -> Option<Array2<f64>> {
    if !all_finite(matrix) {
        return None;
    }
    matrix.to_owned().inv().ok()
}

/// Inverse of a square matrix with NaN in every entry on failure.
pub fn invert_or_nan(matrix: &ArrayView2<f64>) -> Array2<f64> {
    try_invert(matrix).unwrap_or_else(|| Array2::from_elem(matrix.raw_dim(), f64::NAN))
}

/// Solves `matrix · x = rhs`, NaN on failure.
pub fn solve_or_nan(matrix: &ArrayView2<f64>, rhs: &ArrayView1<f64>) -> Array1<f64> {
    if !all_finite(matrix) || rhs.iter().any(|value| !value.is_finite()) {
        return Array1::from_elem(rhs.len(), f64::NAN);
    }
    matrix
        .to_owned()
        .solve(&rhs.to_owned())
        .unwrap_or_else(|_| Array1::from_elem(rhs.len(), f64::NAN))
}

/// Natural log of the determinant; NaN unless the determinant is positive.
pub fn log_det(matrix: &ArrayView2<f64>) -> f64 {
    if !all_finite(matrix) {
        return f64::NAN;
    }
    match matrix.to_owned().sln_det() {
        Ok((sign, logabs)) if sign > 0.0 => logabs,
        _ => f64::NAN,
    }
}

/// Numerical rank from the singular values, cut at `max(m, n) · ε · σ_max`.
pub fn matrix_rank(matrix: &ArrayView2<f64>) -> usize {
    if matrix.is_empty() || !all_finite(matrix) {
        return 0;
    }
    let singular = match matrix.to_owned().svd(false, false) {
        Ok((_, singular, _)) => singular,
        Err(_) => return 0,
    };
    let largest = singular.iter().cloned().fold(0.0_f64, f64::max);
    let tolerance = largest * matrix.nrows().max(matrix.ncols()) as f64 * f64::EPSILON;
    singular.iter().filter(|&&value| value > tolerance).count()
}

/// Column-major vectorisation: entry (i, j) lands at `i + j * nrows`.
pub fn vec_columns(matrix: &ArrayView2<f64>) -> Array1<f64> {
    let rows = matrix.nrows();
    let mut out = Array1::zeros(matrix.len());
    for ((i, j), value) in matrix.indexed_iter() {
        out[i + j * rows] = *value;
    }
    out
}

/// Half-vectorisation of the lower triangle, column by column.
pub fn vech(matrix: &ArrayView2<f64>) -> Array1<f64> {
    let n = matrix.nrows();
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for j in 0..n {
        for i in j..n {
            out.push(matrix[[i, j]]);
        }
    }
    Array1::from(out)
}

/// Symmetric matrix rebuilt from its half-vectorisation.
pub fn unvech(values: &ArrayView1<f64>, n: usize) -> Array2<f64> {
    let mut out = Array2::zeros((n, n));
    let mut cursor = 0;
    for j in 0..n {
        for i in j..n {
            out[[i, j]] = values[cursor];
            out[[j, i]] = values[cursor];
            cursor += 1;
        }
    }
    out
}

/// Duplication matrix `Dup` with `vec(A) = Dup · vech(A)` for symmetric `A`.
pub fn duplication_matrix(n: usize) -> Array2<f64> {
    let mut dup = Array2::zeros((n * n, n * (n + 1) / 2));
    let mut column = 0;
    for j in 0..n {
        for i in j..n {
            dup[[i + j * n, column]] = 1.0;
            dup[[j + i * n, column]] = 1.0;
            column += 1;
        }
    }
    dup
}

/// Kronecker product, consistent with [`vec_columns`].
pub fn kron(left: &ArrayView2<f64>, right: &ArrayView2<f64>) -> Array2<f64> {
    let (lr, lc) = left.dim();
    let (rr, rc) = right.dim();
    let mut out = Array2::zeros((lr * rr, lc * rc));
    for ((i, j), &a) in left.indexed_iter() {
        if a == 0.0 {
            continue;
        }
        for ((k, l), &b) in right.indexed_iter() {
            out[[i * rr + k, j * rc + l]] = a * b;
        }
    }
    out
}

/// Nearest positive semi-definite matrix by clamping negative eigenvalues.
pub fn project_psd(matrix: &ArrayView2<f64>) -> Array2<f64> {
    if !all_finite(matrix) {
        return Array2::from_elem(matrix.raw_dim(), f64::NAN);
    }
    let symmetric = (matrix.to_owned() + matrix.t()) * 0.5;
    match symmetric.eigh(UPLO::Lower) {
        Ok((values, vectors)) => {
            let clamped = values.mapv(|value| value.max(0.0));
            let scaled = &vectors * &clamped;
            scaled.dot(&vectors.t())
        }
        Err(_) => Array2::from_elem(matrix.raw_dim(), f64::NAN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn singular_inverse_is_all_nan() {
        let singular = array![[1.0, 2.0], [2.0, 4.0]];
        let inverse = invert_or_nan(&singular.view());
        assert!(inverse.iter().all(|value| value.is_nan()));
    }

    #[test]
    fn duplication_matrix_maps_vech_to_vec() {
        let symmetric = array![[2.0, -1.0, 0.5], [-1.0, 3.0, 4.0], [0.5, 4.0, 1.0]];
        let expanded = duplication_matrix(3).dot(&vech(&symmetric.view()));
        assert_eq!(expanded, vec_columns(&symmetric.view()));
        assert_eq!(unvech(&vech(&symmetric.view()).view(), 3), symmetric);
    }

    #[test]
    fn kron_matches_vec_identity() {
        // vec(A X B) = (B' kron A) vec(X)
        let a = array![[1.0, 2.0], [0.0, -1.0]];
        let x = array![[0.5, 1.5], [2.0, -3.0]];
        let b = array![[4.0, 1.0], [1.0, 2.0]];
        let lhs = vec_columns(&a.dot(&x).dot(&b).view());
        let rhs = kron(&b.t(), &a.view()).dot(&vec_columns(&x.view()));
        for (l, r) in lhs.iter().zip(rhs.iter()) {
            assert_abs_diff_eq!(*l, *r, epsilon = 1e-12);
        }
    }

    #[test]
    fn rank_counts_independent_rows() {
        let matrix = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        assert_eq!(matrix_rank(&matrix.view()), 2);
    }

    #[test]
    fn psd_projection_clamps_negative_eigenvalues() {
        let indefinite = array![[1.0, 0.0], [0.0, -2.0]];
        let projected = project_psd(&indefinite.view());
        assert_abs_diff_eq!(projected[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(projected[[1, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn log_det_of_diagonal() {
        let diagonal = array![[2.0, 0.0], [0.0, 3.0]];
        assert_abs_diff_eq!(log_det(&diagonal.view()), 6.0_f64.ln(), epsilon = 1e-12);
        assert!(log_det(&array![[-1.0]].view()).is_nan());
    }
}
