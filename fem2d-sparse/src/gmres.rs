use crate::Real;
use core::fmt;
use log::trace;
use nalgebra::base::constraint::AreMultipliable;
use nalgebra::constraint::{DimEq, ShapeConstraint};
use nalgebra::storage::Storage;
use nalgebra::{
    ClosedAdd, ClosedMul, DMatrix, DVector, DVectorView, DVectorViewMut, Dim, Dyn, Matrix, Scalar, U1,
};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use num::{One, Zero};
use std::error::Error;
use std::ops::{Deref, DerefMut};

/// A linear map `y = A x`.
pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T, R, C, S> LinearOperator<T> for Matrix<T, R, C, S>
where
    T: Scalar + One + Zero + ClosedMul + ClosedAdd,
    R: Dim,
    C: Dim,
    S: Storage<T, R, C>,
    ShapeConstraint: DimEq<Dyn, R> + DimEq<C, Dyn> + AreMultipliable<R, C, Dyn, U1>,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T> LinearOperator<T> for CsrMatrix<T>
where
    T: Scalar + Zero + One + ClosedMul + ClosedAdd,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(self), Op::NoOp(&x));
        Ok(())
    }
}

pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        y.copy_from(&x);
        Ok(())
    }
}

/// The transpose `y = A^T x` of a wrapped operator.
///
/// Only implemented for operators that can apply their transpose without forming it.
#[derive(Debug, Clone, Copy)]
pub struct Transpose<A>(pub A);

impl<'a, T> LinearOperator<T> for Transpose<&'a CsrMatrix<T>>
where
    T: Scalar + Zero + One + ClosedMul + ClosedAdd,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error + Send + Sync>> {
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::Transpose(self.0), Op::NoOp(&x));
        Ok(())
    }
}

pub trait GmresStoppingCriterion<T: Scalar> {
    /// Decides convergence from the residual norm `||b - Ax||`.
    ///
    /// Inside a restart cycle the residual norm is the estimate given by the least-squares
    /// problem. At the end of a cycle it is the true residual.
    fn has_converged(&self, b_norm: T, iteration: usize, residual_norm: T) -> Result<bool, SolveErrorKind>;
}

/// Relative residual tolerance ||r|| <= tol * ||b||.
///
/// With right preconditioning the residual tracked by GMRES is the residual of the
/// unpreconditioned system, so the criterion measures the quantity callers care about.
#[derive(Debug, Clone, Copy)]
pub struct RelativeResidualCriterion<T: Scalar> {
    tol: T,
}

impl<T: Scalar> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }

    pub fn tolerance(&self) -> &T {
        &self.tol
    }
}

impl Default for RelativeResidualCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-10)
    }
}

impl<T: Real> GmresStoppingCriterion<T> for RelativeResidualCriterion<T> {
    fn has_converged(&self, b_norm: T, _iteration: usize, residual_norm: T) -> Result<bool, SolveErrorKind> {
        Ok(residual_norm <= self.tol * b_norm)
    }
}

#[derive(Debug, Clone)]
pub struct GmresWorkspace<T: Scalar> {
    basis: DMatrix<T>,
    hessenberg: DMatrix<T>,
    cosines: DVector<T>,
    sines: DVector<T>,
    g: DVector<T>,
    y: DVector<T>,
    r: DVector<T>,
    w: DVector<T>,
    z: DVector<T>,
}

struct Buffers<'a, T: Scalar> {
    basis: &'a mut DMatrix<T>,
    hessenberg: &'a mut DMatrix<T>,
    cosines: &'a mut DVector<T>,
    sines: &'a mut DVector<T>,
    g: &'a mut DVector<T>,
    y: &'a mut DVector<T>,
    r: &'a mut DVector<T>,
    w: &'a mut DVector<T>,
    z: &'a mut DVector<T>,
}

impl<T: Scalar + Zero> Default for GmresWorkspace<T> {
    fn default() -> Self {
        Self {
            basis: DMatrix::zeros(0, 0),
            hessenberg: DMatrix::zeros(0, 0),
            cosines: DVector::zeros(0),
            sines: DVector::zeros(0),
            g: DVector::zeros(0),
            y: DVector::zeros(0),
            r: DVector::zeros(0),
            w: DVector::zeros(0),
            z: DVector::zeros(0),
        }
    }
}

impl<T: Scalar + Zero> GmresWorkspace<T> {
    fn prepare_buffers(&mut self, dim: usize, restart: usize) -> Buffers<'_, T> {
        self.basis.resize_mut(dim, restart + 1, T::zero());
        self.hessenberg.resize_mut(restart + 1, restart, T::zero());
        self.cosines.resize_vertically_mut(restart, T::zero());
        self.sines.resize_vertically_mut(restart, T::zero());
        self.g.resize_vertically_mut(restart + 1, T::zero());
        self.y.resize_vertically_mut(restart, T::zero());
        self.r.resize_vertically_mut(dim, T::zero());
        self.w.resize_vertically_mut(dim, T::zero());
        self.z.resize_vertically_mut(dim, T::zero());
        Buffers {
            basis: &mut self.basis,
            hessenberg: &mut self.hessenberg,
            cosines: &mut self.cosines,
            sines: &mut self.sines,
            g: &mut self.g,
            y: &mut self.y,
            r: &mut self.r,
            w: &mut self.w,
            z: &mut self.z,
        }
    }
}

#[derive(Debug)]
enum OwnedOrMutRef<'a, T> {
    Owned(T),
    MutRef(&'a mut T),
}

impl<'a, T> Deref for OwnedOrMutRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

impl<'a, T> DerefMut for OwnedOrMutRef<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

/// Restarted GMRES with right preconditioning.
///
/// Solves `A x = b` by minimizing `||b - A x||` over the Krylov space generated by
/// `A M`, where `M` is the preconditioner (an approximate inverse of `A`). The
/// Krylov basis is discarded and rebuilt from the current residual every `restart` iterations.
#[derive(Debug)]
pub struct Gmres<'a, T, A, P, Criterion>
where
    T: Scalar,
{
    workspace: OwnedOrMutRef<'a, GmresWorkspace<T>>,
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    restart: usize,
    max_iter: Option<usize>,
}

const DEFAULT_RESTART: usize = 200;

impl<'a, T: Scalar + Zero> Gmres<'a, T, (), IdentityOperator, ()> {
    pub fn new() -> Self {
        Self {
            workspace: OwnedOrMutRef::Owned(GmresWorkspace::default()),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            restart: DEFAULT_RESTART,
            max_iter: None,
        }
    }
}

impl<'a, T: Scalar> Gmres<'a, T, (), IdentityOperator, ()> {
    pub fn with_workspace(workspace: &'a mut GmresWorkspace<T>) -> Self {
        Self {
            workspace: OwnedOrMutRef::MutRef(workspace),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            restart: DEFAULT_RESTART,
            max_iter: None,
        }
    }
}

impl<'a, T: Scalar, P, Criterion> Gmres<'a, T, (), P, Criterion> {
    pub fn with_operator<A>(self, operator: A) -> Gmres<'a, T, A, P, Criterion> {
        Gmres {
            workspace: self.workspace,
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            restart: self.restart,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T: Scalar, A, P, Criterion> Gmres<'a, T, A, P, Criterion> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> Gmres<'a, T, A, P2, Criterion> {
        Gmres {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            restart: self.restart,
            max_iter: self.max_iter,
        }
    }

    /// Sets the number of iterations per restart cycle. Values below 1 are treated as 1.
    pub fn with_restart(self, restart: usize) -> Self {
        Self {
            restart: restart.max(1),
            ..self
        }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

impl<'a, T: Scalar, A, P> Gmres<'a, T, A, P, ()> {
    pub fn with_stopping_criterion<Criterion>(self, stopping_criterion: Criterion) -> Gmres<'a, T, A, P, Criterion> {
        Gmres {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            restart: self.restart,
            max_iter: self.max_iter,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(Box<dyn Error + Send + Sync>),
    PreconditionerError(Box<dyn Error + Send + Sync>),
    StoppingCriterionError(Box<dyn Error + Send + Sync>),
    /// The upper Hessenberg matrix became singular, so no least-squares update exists.
    Breakdown,
    MaxIterationsReached {
        max_iter: usize,
    },
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "Error applying operator: ")?;
                err.fmt(f)
            }
            Self::PreconditionerError(err) => {
                write!(f, "Error applying preconditioner: ")?;
                err.fmt(f)
            }
            Self::StoppingCriterionError(err) => {
                write!(f, "Error evaluating stopping criterion: ")?;
                err.fmt(f)
            }
            Self::Breakdown => write!(f, "GMRES breakdown: singular Hessenberg matrix"),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

impl Error for SolveErrorKind {}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    pub output: GmresOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> SolveError<T> {
    fn new(output: GmresOutput<T>, kind: SolveErrorKind) -> Self {
        Self { output, kind }
    }
}

impl<T> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GMRES solve failed after {} iterations. ", self.output.num_iterations)?;
        write!(f, "Error: {}", self.kind)
    }
}

impl<T: fmt::Debug> Error for SolveError<T> {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct GmresOutput<T> {
    /// Total number of Krylov iterations (operator applications inside restart cycles).
    pub num_iterations: usize,
    /// Number of completed restart cycles.
    pub num_restarts: usize,
    /// Norm of the true residual `b - A x` at the returned iterate.
    pub residual_norm: T,
}

/// y = Ax
fn apply_operator<'a, T, A>(
    y: impl Into<DVectorViewMut<'a, T>>,
    a: &A,
    x: impl Into<DVectorView<'a, T>>,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    T: Scalar,
    A: LinearOperator<T>,
{
    a.apply(y.into(), x.into())
}

impl<'a, T, A, P, Criterion> Gmres<'a, T, A, P, Criterion>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
    Criterion: GmresStoppingCriterion<T>,
{
    /// Solves `A x = b`, using the current contents of `x` as the initial guess.
    ///
    /// On failure the best iterate found so far is left in `x`.
    pub fn solve_with_guess<'b>(
        &mut self,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<GmresOutput<T>, SolveError<T>> {
        self.solve_with_guess_(b.into(), x.into())
    }

    fn solve_with_guess_(&mut self, b: DVectorView<T>, mut x: DVectorViewMut<T>) -> Result<GmresOutput<T>, SolveError<T>> {
        use SolveErrorKind::*;
        assert_eq!(b.len(), x.len());

        let restart = self.restart;
        let mut output = GmresOutput {
            num_iterations: 0,
            num_restarts: 0,
            residual_norm: T::zero(),
        };

        let Buffers {
            basis,
            hessenberg,
            cosines,
            sines,
            g,
            y,
            r,
            w,
            z,
        } = self.workspace.prepare_buffers(x.len(), restart);

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        // r = b - Ax
        if let Err(err) = apply_operator(&mut *r, &self.operator, &x) {
            return Err(SolveError::new(output, OperatorError(err)));
        }
        r.axpy(T::one(), &b, -T::one());
        let mut beta = r.norm();
        output.residual_norm = beta;

        loop {
            match self
                .stopping_criterion
                .has_converged(b_norm, output.num_iterations, beta)
            {
                Ok(true) => return Ok(output),
                Ok(false) => {}
                Err(kind) => return Err(SolveError::new(output, kind)),
            }
            if let Some(max_iter) = self.max_iter {
                if output.num_iterations >= max_iter {
                    return Err(SolveError::new(output, MaxIterationsReached { max_iter }));
                }
            }

            // v_0 = r / beta, g = beta e_1
            {
                let mut v0 = basis.column_mut(0);
                v0.copy_from(&*r);
                v0 /= beta;
            }
            g.fill(T::zero());
            g[0] = beta;

            let mut k = 0;
            while k < restart {
                let j = k;

                // w = A M v_j
                if let Err(err) = apply_operator(&mut *z, &self.preconditioner, basis.column(j)) {
                    return Err(SolveError::new(output, PreconditionerError(err)));
                }
                if let Err(err) = apply_operator(&mut *w, &self.operator, &*z) {
                    return Err(SolveError::new(output, OperatorError(err)));
                }

                // Modified Gram-Schmidt
                for i in 0..=j {
                    let h_ij = basis.column(i).dot(&*w);
                    hessenberg[(i, j)] = h_ij;
                    w.axpy(-h_ij, &basis.column(i), T::one());
                }
                let h_next = w.norm();
                hessenberg[(j + 1, j)] = h_next;
                if h_next > T::zero() {
                    let mut v_next = basis.column_mut(j + 1);
                    v_next.copy_from(&*w);
                    v_next /= h_next;
                }

                // Apply the accumulated Givens rotations to the new column
                for i in 0..j {
                    let (c, s) = (cosines[i], sines[i]);
                    let h_i = hessenberg[(i, j)];
                    let h_i1 = hessenberg[(i + 1, j)];
                    hessenberg[(i, j)] = c * h_i + s * h_i1;
                    hessenberg[(i + 1, j)] = -s * h_i + c * h_i1;
                }
                let h_jj = hessenberg[(j, j)];
                let denom = h_jj.hypot(h_next);
                let (c, s) = if denom == T::zero() {
                    (T::one(), T::zero())
                } else {
                    (h_jj / denom, h_next / denom)
                };
                cosines[j] = c;
                sines[j] = s;
                hessenberg[(j, j)] = denom;
                hessenberg[(j + 1, j)] = T::zero();
                g[j + 1] = -s * g[j];
                g[j] = c * g[j];

                output.num_iterations += 1;
                k += 1;

                let estimate = g[j + 1].abs();
                let converged = match self
                    .stopping_criterion
                    .has_converged(b_norm, output.num_iterations, estimate)
                {
                    Ok(converged) => converged,
                    Err(kind) => return Err(SolveError::new(output, kind)),
                };
                let exhausted = self
                    .max_iter
                    .map(|max_iter| output.num_iterations >= max_iter)
                    .unwrap_or(false);
                if converged || exhausted || h_next == T::zero() {
                    break;
                }
            }

            // Solve the triangular system H y = g
            for i in (0..k).rev() {
                let mut sum = g[i];
                for l in (i + 1)..k {
                    sum -= hessenberg[(i, l)] * y[l];
                }
                let h_ii = hessenberg[(i, i)];
                if h_ii == T::zero() {
                    return Err(SolveError::new(output, Breakdown));
                }
                y[i] = sum / h_ii;
            }

            // x <- x + M V y
            w.fill(T::zero());
            for i in 0..k {
                w.axpy(y[i], &basis.column(i), T::one());
            }
            if let Err(err) = apply_operator(&mut *z, &self.preconditioner, &*w) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            x += &*z;

            // Recompute the true residual, since the estimate drifts in finite precision
            if let Err(err) = apply_operator(&mut *r, &self.operator, &x) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            r.axpy(T::one(), &b, -T::one());
            beta = r.norm();
            output.residual_norm = beta;
            output.num_restarts += 1;
            trace!(
                "GMRES cycle {} finished after {} iterations, residual {}",
                output.num_restarts,
                output.num_iterations,
                beta
            );
        }
    }
}
