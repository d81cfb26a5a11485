//! The implicit equilibrium solver and its forward and adjoint linear solves.
use crate::assembly::StiffnessAssembler;
use crate::Real;
use core::fmt;
use fem2d_sparse::gmres::{Gmres, GmresWorkspace, RelativeResidualCriterion, SolveError, SolveErrorKind};
use fem2d_sparse::triplets::TripletError;
use fem2d_sparse::{FactorizationError, IncompleteLu, Transpose, TripletScatter, Triplets};
use log::{debug, trace, warn};
use nalgebra::{DVector, DVectorView, DVectorViewMut, Scalar};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use std::error::Error;

mod settings;

pub use settings::SolverSettings;

#[derive(Debug)]
#[non_exhaustive]
pub enum EquilibriumError {
    /// The incomplete factorization of the stiffness matrix failed.
    Factorization(FactorizationError),
    /// An input vector has the wrong length. Checked before any assembly takes place.
    DimensionMismatch {
        quantity: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The assembler failed or produced unusable triplets.
    Assembly(eyre::Report),
    /// The assembler wrote indices that differ from the ones its sparsity pattern was
    /// discovered from.
    PatternViolation { matrix: &'static str, entry: usize },
    /// Applying the operator or preconditioner failed inside GMRES.
    Krylov(SolveErrorKind),
}

impl fmt::Display for EquilibriumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factorization(err) => write!(f, "Failed to factor stiffness matrix: {}", err),
            Self::DimensionMismatch {
                quantity,
                expected,
                actual,
            } => write!(f, "{} has length {}, expected {}", quantity, actual, expected),
            Self::Assembly(err) => write!(f, "Assembly failed: {}", err),
            Self::PatternViolation { matrix, entry } => write!(
                f,
                "Triplet {} of the {} matrix does not match the discovered sparsity pattern",
                entry, matrix
            ),
            Self::Krylov(kind) => write!(f, "Linear solve failed: {}", kind),
        }
    }
}

impl Error for EquilibriumError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Factorization(err) => Some(err),
            Self::Assembly(err) => Some(<eyre::Report as AsRef<dyn Error>>::as_ref(err)),
            Self::Krylov(kind) => Some(kind),
            _ => None,
        }
    }
}

impl From<FactorizationError> for EquilibriumError {
    fn from(err: FactorizationError) -> Self {
        Self::Factorization(err)
    }
}

fn check_dim(quantity: &'static str, expected: usize, actual: usize) -> Result<(), EquilibriumError> {
    if expected != actual {
        Err(EquilibriumError::DimensionMismatch {
            quantity,
            expected,
            actual,
        })
    } else {
        Ok(())
    }
}

fn invalid_triplets(matrix: &'static str, err: TripletError) -> EquilibriumError {
    EquilibriumError::Assembly(eyre::Report::new(err).wrap_err(format!("Invalid {} triplets", matrix)))
}

/// Selects the operator of a linear solve.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SolveMode {
    /// Solve `K x = b`, preconditioned with `(LU)^-1`.
    Forward,
    /// Solve `K^T x = b`, preconditioned with `(LU)^-T`.
    Reverse,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SolveStatus<T> {
    /// Whether the relative residual tolerance was reached within the iteration cap.
    pub converged: bool,
    pub iterations: usize,
    /// Norm of the true residual at the returned solution.
    pub residual_norm: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolution<T: Scalar> {
    pub solution: DVector<T>,
    pub status: SolveStatus<T>,
}

/// Partial derivatives of the residual `R(x, u, f) = K(x) u - f`.
#[derive(Debug, Copy, Clone)]
pub struct Partials<'a, T> {
    /// `dR/du = K(x)`.
    pub d_state: &'a CsrMatrix<T>,
    /// `dR/dx`, with one column per element.
    pub d_design: &'a CsrMatrix<T>,
    /// `dR/df = -I`.
    pub d_rhs: &'a CsrMatrix<T>,
}

/// Receives the inputs of every [`EquilibriumSolver::linearize`] call it is passed to.
pub trait LinearizationObserver<T: Scalar> {
    fn observe(&mut self, iteration: usize, multipliers: DVectorView<T>, state: DVectorView<T>);
}

impl<T, F> LinearizationObserver<T> for F
where
    T: Scalar,
    F: FnMut(usize, DVectorView<T>, DVectorView<T>),
{
    fn observe(&mut self, iteration: usize, multipliers: DVectorView<T>, state: DVectorView<T>) {
        self(iteration, multipliers, state)
    }
}

/// The stiffness matrix over its fixed sparsity pattern, together with its preconditioner.
///
/// The pattern is the union of the assembler's index pairs and the diagonal. The incomplete
/// factorization is dropped on every value update and rebuilt on demand, so it always
/// belongs to the current values.
#[derive(Debug, Clone)]
pub struct StiffnessMatrix<T: Real> {
    triplets: Triplets<T>,
    scatter: TripletScatter,
    matrix: CsrMatrix<T>,
    preconditioner: Option<IncompleteLu<T>>,
    drop_tolerance: T,
}

impl<T: Real> StiffnessMatrix<T> {
    fn discover(assembler: &impl StiffnessAssembler<T>, drop_tolerance: T) -> Result<Self, EquilibriumError> {
        let n = assembler.state_dim();
        let mut triplets = Triplets::zeros(n, n, assembler.stiffness_nnz());
        let ones = DVector::repeat(assembler.num_elements(), T::one());
        assembler
            .assemble_stiffness_into(&mut triplets, DVectorView::from(&ones))
            .map_err(EquilibriumError::Assembly)?;
        let scatter = TripletScatter::from_triplets(&triplets, true).map_err(|err| invalid_triplets("stiffness", err))?;
        let mut matrix = scatter.new_matrix();
        scatter.scatter_into(&mut matrix, triplets.values());
        trace!(
            "Discovered stiffness pattern: {} triplets, {} stored entries",
            triplets.len(),
            matrix.nnz()
        );
        Ok(Self {
            triplets,
            scatter,
            matrix,
            preconditioner: None,
            drop_tolerance,
        })
    }

    fn update(&mut self, assembler: &impl StiffnessAssembler<T>, multipliers: DVectorView<T>) -> Result<(), EquilibriumError> {
        self.preconditioner = None;
        assembler
            .assemble_stiffness_into(&mut self.triplets, multipliers)
            .map_err(EquilibriumError::Assembly)?;
        if let Some(entry) = self.scatter.find_mismatch(&self.triplets) {
            return Err(EquilibriumError::PatternViolation {
                matrix: "stiffness",
                entry,
            });
        }
        self.scatter.scatter_into(&mut self.matrix, self.triplets.values());
        Ok(())
    }

    /// The matrix together with a preconditioner built from its current values.
    fn factored(&mut self) -> Result<(&CsrMatrix<T>, &IncompleteLu<T>), EquilibriumError> {
        let preconditioner = match &mut self.preconditioner {
            Some(ilu) => ilu,
            empty => {
                let ilu = IncompleteLu::factor(&self.matrix, self.drop_tolerance)?;
                trace!("Rebuilt incomplete LU preconditioner of dimension {}", ilu.dim());
                empty.insert(ilu)
            }
        };
        Ok((&self.matrix, &*preconditioner))
    }

    pub fn matrix(&self) -> &CsrMatrix<T> {
        &self.matrix
    }

    /// The triplets of the most recent assembly.
    pub fn triplets(&self) -> &Triplets<T> {
        &self.triplets
    }

    /// The preconditioner, if one has been built since the last value update.
    pub fn preconditioner(&self) -> Option<&IncompleteLu<T>> {
        self.preconditioner.as_ref()
    }

    /// Computes `max |K - K^T|` over all stored entries.
    pub fn symmetry_defect(&self) -> T {
        self.matrix
            .triplet_iter()
            .map(|(i, j, v)| {
                let v_transpose = self
                    .matrix
                    .get_entry(j, i)
                    .map(|entry| entry.into_value())
                    .unwrap_or_else(T::zero);
                (*v - v_transpose).abs()
            })
            .fold(T::zero(), |max, defect| max.max(defect))
    }
}

/// The derivative `dR/dx` of the residual over its fixed sparsity pattern.
#[derive(Debug, Clone)]
pub struct ResidualDerivative<T: Real> {
    triplets: Triplets<T>,
    scatter: TripletScatter,
    matrix: CsrMatrix<T>,
}

impl<T: Real> ResidualDerivative<T> {
    fn discover(assembler: &impl StiffnessAssembler<T>) -> Result<Self, EquilibriumError> {
        let mut triplets = Triplets::zeros(assembler.state_dim(), assembler.num_elements(), assembler.derivative_nnz());
        let ones = DVector::repeat(assembler.state_dim(), T::one());
        assembler
            .assemble_stiffness_derivative_into(&mut triplets, DVectorView::from(&ones))
            .map_err(EquilibriumError::Assembly)?;
        let scatter =
            TripletScatter::from_triplets(&triplets, false).map_err(|err| invalid_triplets("derivative", err))?;
        let matrix = scatter.new_matrix();
        Ok(Self {
            triplets,
            scatter,
            matrix,
        })
    }

    fn update(&mut self, assembler: &impl StiffnessAssembler<T>, state: DVectorView<T>) -> Result<(), EquilibriumError> {
        assembler
            .assemble_stiffness_derivative_into(&mut self.triplets, state)
            .map_err(EquilibriumError::Assembly)?;
        if let Some(entry) = self.scatter.find_mismatch(&self.triplets) {
            return Err(EquilibriumError::PatternViolation {
                matrix: "derivative",
                entry,
            });
        }
        self.scatter.scatter_into(&mut self.matrix, self.triplets.values());
        Ok(())
    }

    pub fn matrix(&self) -> &CsrMatrix<T> {
        &self.matrix
    }

    pub fn triplets(&self) -> &Triplets<T> {
        &self.triplets
    }
}

/// Solves the linear equilibrium system `K(x) u = f` and its linearizations.
///
/// The solver owns the stiffness matrix, its preconditioner, the residual derivative and the
/// current state. The state is the initial guess of the next [`solve_state`](Self::solve_state)
/// call. All operations take `&mut self`: a solver serves one design evaluation at a time.
#[derive(Debug)]
pub struct EquilibriumSolver<T: Real, A> {
    assembler: A,
    settings: SolverSettings<T>,
    stiffness: StiffnessMatrix<T>,
    derivative: ResidualDerivative<T>,
    rhs_derivative: CsrMatrix<T>,
    state: DVector<T>,
    workspace: GmresWorkspace<T>,
}

impl<T, A> EquilibriumSolver<T, A>
where
    T: Real,
    A: StiffnessAssembler<T>,
{
    /// Discovers the sparsity patterns of the assembler with a field of unit multipliers.
    pub fn new(assembler: A, settings: SolverSettings<T>) -> Result<Self, EquilibriumError> {
        let stiffness = StiffnessMatrix::discover(&assembler, settings.drop_tolerance)?;
        let derivative = ResidualDerivative::discover(&assembler)?;
        let n = assembler.state_dim();
        let mut rhs_derivative = CsrMatrix::<T>::identity(n);
        for v in rhs_derivative.values_mut() {
            *v = -*v;
        }
        Ok(Self {
            assembler,
            settings,
            stiffness,
            derivative,
            rhs_derivative,
            state: DVector::zeros(n),
            workspace: GmresWorkspace::default(),
        })
    }

    pub fn assembler(&self) -> &A {
        &self.assembler
    }

    pub fn settings(&self) -> &SolverSettings<T> {
        &self.settings
    }

    pub fn num_elements(&self) -> usize {
        self.assembler.num_elements()
    }

    pub fn state_dim(&self) -> usize {
        self.assembler.state_dim()
    }

    /// The state of the most recent forward solve.
    pub fn state(&self) -> &DVector<T> {
        &self.state
    }

    /// Replaces the initial guess of the next forward solve.
    pub fn set_state<'a>(&mut self, state: impl Into<DVectorView<'a, T>>) -> Result<(), EquilibriumError> {
        let state = state.into();
        check_dim("state", self.state_dim(), state.len())?;
        self.state.copy_from(&state);
        Ok(())
    }

    pub fn stiffness(&self) -> &StiffnessMatrix<T> {
        &self.stiffness
    }

    pub fn residual_derivative(&self) -> &ResidualDerivative<T> {
        &self.derivative
    }

    /// Evaluates the residual `K(x) u - f`.
    ///
    /// The stiffness matrix is reassembled from `multipliers`, which discards the preconditioner.
    pub fn apply<'a>(
        &mut self,
        multipliers: impl Into<DVectorView<'a, T>>,
        rhs: impl Into<DVectorView<'a, T>>,
        state: impl Into<DVectorView<'a, T>>,
    ) -> Result<DVector<T>, EquilibriumError> {
        let (multipliers, rhs, state) = (multipliers.into(), rhs.into(), state.into());
        check_dim("multipliers", self.num_elements(), multipliers.len())?;
        check_dim("rhs", self.state_dim(), rhs.len())?;
        check_dim("state", self.state_dim(), state.len())?;

        self.stiffness.update(&self.assembler, multipliers)?;
        let mut residual = rhs.clone_owned();
        spmm_csr_dense(-T::one(), &mut residual, T::one(), Op::NoOp(self.stiffness.matrix()), Op::NoOp(&state));
        Ok(residual)
    }

    /// Solves `K(x) u = f`, starting from the state of the previous solve.
    ///
    /// Reaching the iteration cap is reported through the returned status rather than as an
    /// error. On success the solver is linearized at `(x, u)`: [`partials`](Self::partials)
    /// and [`solve_linear`](Self::solve_linear) use the new stiffness matrix, its
    /// preconditioner and the residual derivative at the new state. On error the stored state
    /// is left unchanged.
    pub fn solve_state<'a>(
        &mut self,
        multipliers: impl Into<DVectorView<'a, T>>,
        rhs: impl Into<DVectorView<'a, T>>,
    ) -> Result<LinearSolution<T>, EquilibriumError> {
        let (multipliers, rhs) = (multipliers.into(), rhs.into());
        check_dim("multipliers", self.num_elements(), multipliers.len())?;
        check_dim("rhs", self.state_dim(), rhs.len())?;

        self.stiffness.update(&self.assembler, multipliers)?;
        let (matrix, preconditioner) = self.stiffness.factored()?;
        let mut solution = self.state.clone();
        let status = run_gmres(
            &mut self.workspace,
            &self.settings,
            matrix,
            preconditioner,
            SolveMode::Forward,
            rhs,
            DVectorViewMut::from(&mut solution),
        )?;

        self.derivative
            .update(&self.assembler, DVectorView::from(&solution))?;
        self.state.copy_from(&solution);
        Ok(LinearSolution { solution, status })
    }

    /// The partial derivatives at the most recent [`solve_state`](Self::solve_state) or
    /// [`linearize`](Self::linearize) call.
    pub fn partials(&self) -> Partials<'_, T> {
        Partials {
            d_state: &self.stiffness.matrix,
            d_design: &self.derivative.matrix,
            d_rhs: &self.rhs_derivative,
        }
    }

    /// Computes the partial derivatives of the residual at `(multipliers, state)`.
    ///
    /// The stiffness matrix is reassembled and its preconditioner rebuilt, so that subsequent
    /// calls to [`solve_linear`](Self::solve_linear) solve with the linearized operator.
    /// If an observer is given, it is notified with the caller's iteration index before any
    /// work is done.
    pub fn linearize<'a>(
        &mut self,
        multipliers: impl Into<DVectorView<'a, T>>,
        state: impl Into<DVectorView<'a, T>>,
        observer: Option<(usize, &mut dyn LinearizationObserver<T>)>,
    ) -> Result<Partials<'_, T>, EquilibriumError> {
        let (multipliers, state) = (multipliers.into(), state.into());
        check_dim("multipliers", self.num_elements(), multipliers.len())?;
        check_dim("state", self.state_dim(), state.len())?;

        if let Some((iteration, observer)) = observer {
            observer.observe(iteration, multipliers.clone(), state.clone());
        }

        self.stiffness.update(&self.assembler, multipliers)?;
        self.stiffness.factored()?;
        self.derivative.update(&self.assembler, state)?;
        Ok(self.partials())
    }

    /// Solves `K y = seed` or `K^T y = seed` with the most recently assembled stiffness matrix,
    /// starting from zero.
    pub fn solve_linear<'a>(
        &mut self,
        seed: impl Into<DVectorView<'a, T>>,
        mode: SolveMode,
    ) -> Result<LinearSolution<T>, EquilibriumError> {
        let seed = seed.into();
        check_dim("seed", self.state_dim(), seed.len())?;
        let mut solution = DVector::zeros(seed.len());
        let status = self.solve_linear_with_guess(seed, &mut solution, mode)?;
        Ok(LinearSolution { solution, status })
    }

    /// Like [`solve_linear`](Self::solve_linear), but starts from `guess` and overwrites it with
    /// the solution.
    pub fn solve_linear_with_guess<'a>(
        &mut self,
        seed: impl Into<DVectorView<'a, T>>,
        guess: impl Into<DVectorViewMut<'a, T>>,
        mode: SolveMode,
    ) -> Result<SolveStatus<T>, EquilibriumError> {
        let (seed, guess) = (seed.into(), guess.into());
        check_dim("seed", self.state_dim(), seed.len())?;
        check_dim("guess", self.state_dim(), guess.len())?;

        let (matrix, preconditioner) = self.stiffness.factored()?;
        run_gmres(&mut self.workspace, &self.settings, matrix, preconditioner, mode, seed, guess)
    }
}

fn run_gmres<T: Real>(
    workspace: &mut GmresWorkspace<T>,
    settings: &SolverSettings<T>,
    matrix: &CsrMatrix<T>,
    preconditioner: &IncompleteLu<T>,
    mode: SolveMode,
    b: DVectorView<T>,
    x: DVectorViewMut<T>,
) -> Result<SolveStatus<T>, EquilibriumError> {
    let max_iter = settings.max_iterations_for(b.len());
    let gmres = Gmres::with_workspace(workspace)
        .with_restart(settings.restart)
        .with_max_iter(max_iter)
        .with_stopping_criterion(RelativeResidualCriterion::new(settings.tolerance));
    let result = match mode {
        SolveMode::Forward => gmres
            .with_operator(matrix)
            .with_preconditioner(preconditioner)
            .solve_with_guess(b, x),
        SolveMode::Reverse => gmres
            .with_operator(Transpose(matrix))
            .with_preconditioner(Transpose(preconditioner))
            .solve_with_guess(b, x),
    };

    match result {
        Ok(output) => {
            debug!(
                "{:?} solve converged after {} iterations ({} restarts), residual {}",
                mode, output.num_iterations, output.num_restarts, output.residual_norm
            );
            Ok(SolveStatus {
                converged: true,
                iterations: output.num_iterations,
                residual_norm: output.residual_norm,
            })
        }
        Err(SolveError {
            output,
            kind: SolveErrorKind::MaxIterationsReached { max_iter },
            ..
        }) => {
            warn!(
                "{:?} solve did not converge within {} iterations, residual {}",
                mode, max_iter, output.residual_norm
            );
            Ok(SolveStatus {
                converged: false,
                iterations: output.num_iterations,
                residual_norm: output.residual_norm,
            })
        }
        Err(SolveError { kind, .. }) => Err(EquilibriumError::Krylov(kind)),
    }
}
