//! Test helpers shared by the workspace crates.
use nalgebra::{DMatrix, DVector};

/// Poor man's approx assertion for matrices
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let diff = $x - $y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", $x);
            println!("right: {}", $y);
            println!("diff: {:e}", diff);
        }
        assert!(approx_eq);
    }};
}

/// Approximates the Jacobian of `f: R^n -> R^m` at `x` with central differences of step `h`.
///
/// Column `j` holds `(f(x + h e_j) - f(x - h e_j)) / 2h`.
pub fn central_difference_jacobian(
    m: usize,
    mut f: impl FnMut(&DVector<f64>) -> DVector<f64>,
    x: &DVector<f64>,
    h: f64,
) -> DMatrix<f64> {
    let n = x.len();
    let mut jacobian = DMatrix::zeros(m, n);
    let mut x_perturbed = x.clone();
    for j in 0..n {
        let x_j = x[j];
        x_perturbed[j] = x_j + h;
        let f_plus = f(&x_perturbed);
        x_perturbed[j] = x_j - h;
        let f_minus = f(&x_perturbed);
        x_perturbed[j] = x_j;

        assert_eq!(f_plus.len(), m, "Function output must have dimension m");
        let mut column = jacobian.column_mut(j);
        column.copy_from(&f_plus);
        column -= &f_minus;
        column /= 2.0 * h;
    }
    jacobian
}

/// Approximates the gradient of `f: R^n -> R` at `x` with central differences of step `h`.
pub fn central_difference_gradient(mut f: impl FnMut(&DVector<f64>) -> f64, x: &DVector<f64>, h: f64) -> DVector<f64> {
    let jacobian = central_difference_jacobian(1, |x| DVector::from_element(1, f(x)), x, h);
    jacobian.row(0).transpose()
}
