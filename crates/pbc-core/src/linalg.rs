//! Small dense helpers for the k×k and r×r matrices of the dual posterior.

use nalgebra::{DMatrix, SymmetricEigen};

use crate::error::{AuditError, Result};

/// Smallest eigenvalue ratio still treated as invertible.
const SINGULAR_RATIO: f64 = 1e-14;

/// Spectrum summary of a symmetric matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditioning {
    pub min_eigenvalue: f64,
    pub max_eigenvalue: f64,
    pub condition_number: f64,
}

/// Eigenvalue check of a symmetric positive definite matrix.
///
/// A non-finite spectrum, or a smallest eigenvalue that is not positive
/// relative to the largest, is reported as `SingularUpdate` for `stage`.
pub fn check_spd(m: &DMatrix<f64>, stage: &str) -> Result<Conditioning> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(AuditError::singular(stage, "matrix has non-finite entries"));
    }
    let eig = SymmetricEigen::new(m.clone());
    let min = eig.eigenvalues.min();
    let max = eig.eigenvalues.max();
    let floor = max.abs() * SINGULAR_RATIO;
    if !min.is_finite() || !max.is_finite() || min <= floor {
        return Err(AuditError::singular(
            stage,
            format!("smallest eigenvalue {min:.3e} (largest {max:.3e})"),
        ));
    }
    Ok(Conditioning {
        min_eigenvalue: min,
        max_eigenvalue: max,
        condition_number: max / min,
    })
}

/// Inverse of a symmetric positive definite matrix, symmetrized.
pub fn spd_inverse(m: &DMatrix<f64>, stage: &str) -> Result<DMatrix<f64>> {
    let chol = m
        .clone()
        .cholesky()
        .ok_or_else(|| AuditError::singular(stage, "Cholesky factorization failed"))?;
    Ok(symmetrize(&chol.inverse()))
}

/// `(M + Mᵀ) / 2`.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Least-squares coefficients of `y` on the columns of `x` (via normal equations).
pub fn least_squares(x: &DMatrix<f64>, y: &[f64], stage: &str) -> Result<Vec<f64>> {
    if x.nrows() != y.len() {
        return Err(AuditError::dims(stage, x.nrows(), y.len()));
    }
    let xtx = x.tr_mul(x);
    let xty = x.tr_mul(&DMatrix::from_column_slice(y.len(), 1, y));
    let inv = spd_inverse(&xtx, stage)?;
    Ok((inv * xty).column(0).iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_spd_accepts_identity() {
        let c = check_spd(&DMatrix::identity(3, 3), "t").unwrap();
        assert!((c.condition_number - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_check_spd_rejects_singular() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(check_spd(&m, "t").unwrap_err().kind(), "singular_update");
        let nan = DMatrix::from_row_slice(1, 1, &[f64::NAN]);
        assert!(check_spd(&nan, "t").is_err());
    }

    #[test]
    fn test_spd_inverse() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let inv = spd_inverse(&m, "t").unwrap();
        let prod = &m * &inv;
        assert!((prod - DMatrix::identity(2, 2)).norm() < 1e-12);
    }

    #[test]
    fn test_least_squares_exact_fit() {
        let x = DMatrix::from_fn(5, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        let y: Vec<f64> = (0..5).map(|i| 2.0 + 3.0 * i as f64).collect();
        let beta = least_squares(&x, &y, "t").unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }
}
