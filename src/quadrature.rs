//! Gauss-Legendre quadrature on the reference square `[-1, 1]^2`.
use crate::Real;
use core::fmt;
use nalgebra::Point2;
use numeric_literals::replace_float_literals;
use std::error::Error;

/// Weights and points of a quadrature rule.
pub type QuadraturePair<T, P> = (Vec<T>, Vec<P>);
pub type QuadraturePair1d<T> = QuadraturePair<T, T>;
pub type QuadraturePair2d<T> = QuadraturePair<T, Point2<T>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedRuleError {
    pub num_points: usize,
}

impl fmt::Display for UnsupportedRuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Gauss-Legendre rules are available for 1 to 3 points per dimension, got {}",
            self.num_points
        )
    }
}

impl Error for UnsupportedRuleError {}

/// The Gauss-Legendre rule with `num_points` points on `[-1, 1]`.
///
/// A rule with `n` points integrates polynomials up to degree `2n - 1` exactly.
#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
pub fn gauss_1d<T: Real>(num_points: usize) -> Result<QuadraturePair1d<T>, UnsupportedRuleError> {
    match num_points {
        1 => Ok((vec![2.0], vec![0.0])),
        2 => {
            let p = (1.0 / 3.0).sqrt();
            Ok((vec![1.0, 1.0], vec![-p, p]))
        }
        3 => {
            let p = (3.0 / 5.0).sqrt();
            Ok((vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0], vec![-p, 0.0, p]))
        }
        _ => Err(UnsupportedRuleError { num_points }),
    }
}

/// Tensor product of the `num_points`-point Gauss-Legendre rule with itself.
pub fn gauss_2d<T: Real>(num_points: usize) -> Result<QuadraturePair2d<T>, UnsupportedRuleError> {
    let (weights_1d, points_1d) = gauss_1d::<T>(num_points)?;
    let mut weights = Vec::with_capacity(num_points * num_points);
    let mut points = Vec::with_capacity(num_points * num_points);
    for (w_i, x_i) in weights_1d.iter().zip(&points_1d) {
        for (w_j, x_j) in weights_1d.iter().zip(&points_1d) {
            weights.push(*w_i * *w_j);
            points.push(Point2::new(*x_i, *x_j));
        }
    }
    Ok((weights, points))
}

/// Approximates the integral of `f` over `[-1, 1]^2` with the given rule.
pub fn integrate_2d<T, F>(rule: &QuadraturePair2d<T>, mut f: F) -> T
where
    T: Real,
    F: FnMut(&Point2<T>) -> T,
{
    let (weights, points) = rule;
    weights
        .iter()
        .zip(points)
        .fold(T::zero(), |sum, (w, p)| sum + *w * f(p))
}
