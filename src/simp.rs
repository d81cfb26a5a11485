//! Elementwise SIMP transforms and adjoint compliance sensitivities.
//!
//! The transforms map design variables to the multipliers consumed by the
//! [`EquilibriumSolver`]. Each comes with its analytic derivative, which is diagonal.
use crate::assembly::StiffnessAssembler;
use crate::solver::{EquilibriumError, EquilibriumSolver, LinearizationObserver, SolveMode, SolveStatus};
use crate::Real;
use log::debug;
use nalgebra::{DVector, DVectorView, Scalar};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use numeric_literals::replace_float_literals;

/// Power-law penalization `y_i = x_i^p`.
pub fn penalize<T: Real>(x: DVectorView<T>, p: T) -> DVector<T> {
    x.map(|x_i| x_i.powf(p))
}

/// The diagonal of `dy/dx` for [`penalize`], `p x_i^(p - 1)`.
pub fn penalize_derivative<T: Real>(x: DVectorView<T>, p: T) -> DVector<T> {
    x.map(|x_i| p * x_i.powf(p - T::one()))
}

/// Smooth Heaviside projection `y_i = 0.5 + 0.5 tanh(x_i) + 0.01`.
///
/// The offset keeps the projected density away from zero.
#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
pub fn heaviside<T: Real>(x: DVectorView<T>) -> DVector<T> {
    x.map(|x_i| 0.5 + 0.5 * x_i.tanh() + 0.01)
}

#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
pub fn heaviside_derivative<T: Real>(x: DVectorView<T>) -> DVector<T> {
    x.map(|x_i| 0.5 / x_i.cosh().powi(2))
}

/// Compliance `f^T u` of the displacement part of a state vector.
///
/// Only the first `forces.len()` entries of `state` are used, so Lagrange multipliers stored
/// after the displacements do not contribute.
pub fn compliance<T: Real>(forces: DVectorView<T>, state: DVectorView<T>) -> T {
    assert!(forces.len() <= state.len(), "Forces must not be longer than the state");
    forces.dot(&state.rows(0, forces.len()))
}

/// Mean of the design variables.
pub fn volume_fraction<T: Real>(x: DVectorView<T>) -> T {
    if x.is_empty() {
        return T::zero();
    }
    x.sum() / T::from_usize(x.len()).expect("Must be able to fit usize in T")
}

pub fn volume_fraction_gradient<T: Real>(num_elements: usize) -> DVector<T> {
    let n = T::from_usize(num_elements.max(1)).expect("Must be able to fit usize in T");
    DVector::repeat(num_elements, T::one() / n)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceEvaluation<T: Scalar> {
    pub compliance: T,
    /// Gradient of the compliance with respect to the design variables.
    pub gradient: DVector<T>,
    pub volume_fraction: T,
    /// Status of the forward solve.
    pub state_status: SolveStatus<T>,
    /// Status of the adjoint solve.
    pub adjoint_status: SolveStatus<T>,
}

/// Compliance of a penalized design together with its adjoint gradient.
///
/// For design variables `x`, the multipliers are `y = x^p`, the state solves
/// `K(y) u = [f; 0]` and the compliance is `c = f^T u`. The gradient follows from the adjoint
/// `K^T lambda = [f; 0]` as `dc/dx = -(dR/dy^T lambda) * dy/dx`.
#[derive(Debug)]
pub struct ComplianceProblem<T: Real, A> {
    solver: EquilibriumSolver<T, A>,
    forces: DVector<T>,
    rhs: DVector<T>,
    penalty: T,
    evaluations: usize,
}

impl<T, A> ComplianceProblem<T, A>
where
    T: Real,
    A: StiffnessAssembler<T>,
{
    /// Creates a problem with nodal `forces` on the displacement degrees of freedom and
    /// homogeneous prescribed values.
    pub fn new(solver: EquilibriumSolver<T, A>, forces: DVector<T>, penalty: T) -> Result<Self, EquilibriumError> {
        let n = solver.state_dim();
        if forces.len() > n {
            return Err(EquilibriumError::DimensionMismatch {
                quantity: "forces",
                expected: n,
                actual: forces.len(),
            });
        }
        let mut rhs = DVector::zeros(n);
        rhs.rows_mut(0, forces.len()).copy_from(&forces);
        Ok(Self {
            solver,
            forces,
            rhs,
            penalty,
            evaluations: 0,
        })
    }

    pub fn solver(&self) -> &EquilibriumSolver<T, A> {
        &self.solver
    }

    pub fn rhs(&self) -> &DVector<T> {
        &self.rhs
    }

    pub fn penalty(&self) -> T {
        self.penalty
    }

    /// Number of completed calls to [`evaluate`](Self::evaluate).
    pub fn num_evaluations(&self) -> usize {
        self.evaluations
    }

    /// Evaluates the compliance and its gradient at `design`.
    ///
    /// The adjoint reuses the stiffness matrix, preconditioner and residual derivative of the
    /// forward solve. The observer, if any, is notified with the index of this evaluation and
    /// the point the gradient is linearized at.
    pub fn evaluate<'a>(
        &mut self,
        design: impl Into<DVectorView<'a, T>>,
        observer: Option<&mut dyn LinearizationObserver<T>>,
    ) -> Result<ComplianceEvaluation<T>, EquilibriumError> {
        let design = design.into();
        if design.len() != self.solver.num_elements() {
            return Err(EquilibriumError::DimensionMismatch {
                quantity: "design",
                expected: self.solver.num_elements(),
                actual: design.len(),
            });
        }

        let multipliers = penalize(design, self.penalty);
        let state = self.solver.solve_state(&multipliers, &self.rhs)?;
        let compliance = compliance(DVectorView::from(&self.forces), DVectorView::from(&state.solution));

        // solve_state leaves the solver linearized at (multipliers, state)
        if let Some(observer) = observer {
            observer.observe(
                self.evaluations,
                DVectorView::from(&multipliers),
                DVectorView::from(&state.solution),
            );
        }

        // dc/du = [f; 0], which is exactly the right-hand side
        let adjoint = self.solver.solve_linear(&self.rhs, SolveMode::Reverse)?;

        let mut gradient = DVector::zeros(design.len());
        spmm_csr_dense(
            T::zero(),
            &mut gradient,
            -T::one(),
            Op::Transpose(self.solver.residual_derivative().matrix()),
            Op::NoOp(&adjoint.solution),
        );
        gradient.component_mul_assign(&penalize_derivative(design, self.penalty));

        self.evaluations += 1;
        debug!(
            "Evaluation {}: compliance {}, gradient norm {}",
            self.evaluations,
            compliance,
            gradient.norm()
        );
        Ok(ComplianceEvaluation {
            compliance,
            gradient,
            volume_fraction: volume_fraction(design),
            state_status: state.status,
            adjoint_status: adjoint.status,
        })
    }
}
