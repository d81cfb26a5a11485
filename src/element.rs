//! Bilinear quadrilateral (Q4) elements on axis-aligned rectangles.
use crate::quadrature::QuadraturePair2d;
use crate::Real;
use nalgebra::{Matrix1x4, Matrix2x4, Matrix3, Point2, SMatrix, Vector2};
use numeric_literals::replace_float_literals;

pub type ElementStiffness<T> = SMatrix<T, 8, 8>;
pub type StrainDisplacement<T> = SMatrix<T, 3, 8>;

/// A four-node bilinear element covering a `width x height` rectangle.
///
/// Local nodes follow the reference square `[-1, 1]^2` counter-clockwise starting at `(-1, -1)`.
/// Since the element is an axis-aligned rectangle, the Jacobian of the reference map is the
/// constant `diag(width / 2, height / 2)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RectangleQ4Element<T> {
    half_size: Vector2<T>,
}

#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
impl<T: Real> RectangleQ4Element<T> {
    pub fn new(width: T, height: T) -> Self {
        Self {
            half_size: Vector2::new(width / 2.0, height / 2.0),
        }
    }

    pub fn jacobian_determinant(&self) -> T {
        self.half_size.x * self.half_size.y
    }

    #[rustfmt::skip]
    pub fn evaluate_basis(&self, xi: &Point2<T>) -> Matrix1x4<T> {
        let phi = |alpha, beta, xi: &Point2<T>| (1.0 + alpha * xi[0]) * (1.0 + beta * xi[1]) / 4.0;
        Matrix1x4::from_row_slice(&[
            phi(-1.0, -1.0, xi),
            phi( 1.0, -1.0, xi),
            phi( 1.0,  1.0, xi),
            phi(-1.0,  1.0, xi),
        ])
    }

    /// Gradients of the basis functions with respect to reference coordinates, one per column.
    #[rustfmt::skip]
    pub fn reference_gradients(&self, xi: &Point2<T>) -> Matrix2x4<T> {
        let phi_grad = |alpha, beta, xi: &Point2<T>|
            Vector2::new(
                alpha * (1.0 + beta * xi[1]) / 4.0,
                beta * (1.0 + alpha * xi[0]) / 4.0,
            );

        Matrix2x4::from_columns(&[
            phi_grad(-1.0, -1.0, xi),
            phi_grad( 1.0, -1.0, xi),
            phi_grad( 1.0,  1.0, xi),
            phi_grad(-1.0,  1.0, xi),
        ])
    }

    /// Gradients of the basis functions with respect to physical coordinates.
    pub fn gradients(&self, xi: &Point2<T>) -> Matrix2x4<T> {
        let mut g = self.reference_gradients(xi);
        g.row_mut(0).unscale_mut(self.half_size.x);
        g.row_mut(1).unscale_mut(self.half_size.y);
        g
    }

    /// The matrix `B` mapping element displacements `[x0, y0, x1, y1, ...]` to the engineering
    /// strain `[eps_xx, eps_yy, 2 eps_xy]`.
    #[allow(non_snake_case)]
    pub fn strain_displacement(&self, xi: &Point2<T>) -> StrainDisplacement<T> {
        let G = self.gradients(xi);
        let mut B = StrainDisplacement::zeros();
        for a in 0..4 {
            let (dx, dy) = (G[(0, a)], G[(1, a)]);
            B[(0, 2 * a)] = dx;
            B[(1, 2 * a + 1)] = dy;
            B[(2, 2 * a)] = dy;
            B[(2, 2 * a + 1)] = dx;
        }
        B
    }

    /// Computes `K_e = ∫ B^T D B dA` with the given quadrature rule on the reference square.
    #[allow(non_snake_case)]
    pub fn stiffness(&self, elasticity: &Matrix3<T>, quadrature: &QuadraturePair2d<T>) -> ElementStiffness<T> {
        let (weights, points) = quadrature;
        let det_J = self.jacobian_determinant();
        let mut K = ElementStiffness::zeros();
        for (w, xi) in weights.iter().zip(points) {
            let B = self.strain_displacement(xi);
            K += B.transpose() * elasticity * B * (*w * det_J);
        }
        K
    }
}
