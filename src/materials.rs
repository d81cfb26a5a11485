use crate::Real;
use eyre::eyre;
use nalgebra::Matrix3;
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YoungPoisson<T> {
    pub young: T,
    pub poisson: T,
}

impl Default for YoungPoisson<f64> {
    fn default() -> Self {
        Self {
            young: 1.0,
            poisson: 0.3,
        }
    }
}

#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
impl<T: Real> YoungPoisson<T> {
    /// Checks that the parameters describe a stable isotropic material in plane stress.
    pub fn validate(&self) -> eyre::Result<()> {
        if !(self.young > 0.0) {
            return Err(eyre!("Young's modulus must be positive, got {}", self.young));
        }
        if !(self.poisson > -1.0 && self.poisson < 0.5) {
            return Err(eyre!("Poisson's ratio must lie in (-1, 0.5), got {}", self.poisson));
        }
        Ok(())
    }

    /// The plane stress elasticity matrix in Voigt notation, mapping
    /// `[eps_xx, eps_yy, 2 eps_xy]` to `[sigma_xx, sigma_yy, sigma_xy]`.
    ///
    /// $$
    /// \vec D = \frac{E}{1 - \nu^2}
    /// \begin{bmatrix} 1 & \nu & 0 \\\\ \nu & 1 & 0 \\\\ 0 & 0 & \frac{1 - \nu}{2} \end{bmatrix}
    /// $$
    #[rustfmt::skip]
    pub fn plane_stress_elasticity(&self) -> Matrix3<T> {
        let YoungPoisson { young, poisson: nu } = *self;
        let c = young / (1.0 - nu * nu);
        Matrix3::new(
            c,      c * nu, 0.0,
            c * nu, c,      0.0,
            0.0,    0.0,    c * (1.0 - nu) / 2.0,
        )
    }
}
