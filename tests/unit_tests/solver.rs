use crate::{cantilever_assembler, tip_load_rhs};
use fem2d::assembly::StiffnessAssembler;
use fem2d::proptest::{dvector, grid_settings, multiplier_field};
use fem2d::solver::{EquilibriumError, EquilibriumSolver, LinearizationObserver, SolveMode, SolverSettings};
use fem2d::sparse::ilu::FactorizationError;
use fem2d::sparse::Triplets;
use fem2d::{assembly::PlaneStressAssembler, materials::YoungPoisson};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector, DVectorView};
use proptest::prelude::*;
use std::cell::Cell;
use util::central_difference_jacobian;

/// A small non-symmetric assembler with `K(x) = x_0 A + x_1 B`.
///
/// The assembler counts its calls and can be told to shift its indices or to fail.
#[derive(Debug, Default)]
struct MockAssembler {
    calls: Cell<usize>,
    shift_indices: Cell<bool>,
    fail: Cell<bool>,
    fail_derivative: Cell<bool>,
}

impl MockAssembler {
    #[rustfmt::skip]
    fn element_matrices() -> [DMatrix<f64>; 2] {
        let a = DMatrix::from_row_slice(4, 4, &[
            6.0, 2.0, 0.0, 1.0,
            -1.0, 5.0, 1.5, 0.0,
            0.0, -2.0, 7.0, 1.0,
            3.0, 0.0, 0.5, 4.0,
        ]);
        let b = DMatrix::from_row_slice(4, 4, &[
            1.0, 0.5, 0.0, 0.0,
            0.0, 1.0, 0.5, 0.0,
            0.0, 0.0, 1.0, 0.5,
            0.0, 0.0, 0.0, 1.0,
        ]);
        [a, b]
    }

    fn dense(multipliers: &DVector<f64>) -> DMatrix<f64> {
        let [a, b] = Self::element_matrices();
        a * multipliers[0] + b * multipliers[1]
    }
}

impl StiffnessAssembler<f64> for MockAssembler {
    fn num_elements(&self) -> usize {
        2
    }

    fn state_dim(&self) -> usize {
        4
    }

    fn stiffness_nnz(&self) -> usize {
        32
    }

    fn derivative_nnz(&self) -> usize {
        32
    }

    fn assemble_stiffness_into(&self, output: &mut Triplets<f64>, multipliers: DVectorView<f64>) -> eyre::Result<()> {
        self.calls.set(self.calls.get() + 1);
        if self.fail.get() {
            eyre::bail!("mock assembly failure");
        }
        let (rows, cols, values) = output.parts_mut();
        for (e, m) in Self::element_matrices().iter().enumerate() {
            for i in 0..4 {
                for j in 0..4 {
                    let idx = 16 * e + 4 * i + j;
                    rows[idx] = i;
                    cols[idx] = if self.shift_indices.get() { (j + 1) % 4 } else { j };
                    values[idx] = multipliers[e] * m[(i, j)];
                }
            }
        }
        Ok(())
    }

    fn assemble_stiffness_derivative_into(&self, output: &mut Triplets<f64>, state: DVectorView<f64>) -> eyre::Result<()> {
        if self.fail_derivative.get() {
            eyre::bail!("mock derivative failure");
        }
        let (rows, cols, values) = output.parts_mut();
        for (e, m) in Self::element_matrices().iter().enumerate() {
            for i in 0..4 {
                for j in 0..4 {
                    let idx = 16 * e + 4 * i + j;
                    rows[idx] = i;
                    cols[idx] = e;
                    values[idx] = m[(i, j)] * state[j];
                }
            }
        }
        Ok(())
    }
}

fn plane_stress_solver(num_nodes_x: usize, num_nodes_y: usize) -> EquilibriumSolver<f64, PlaneStressAssembler<f64>> {
    EquilibriumSolver::new(cantilever_assembler(num_nodes_x, num_nodes_y), SolverSettings::default()).unwrap()
}

fn residual_norm(solver: &mut EquilibriumSolver<f64, PlaneStressAssembler<f64>>, x: &DVector<f64>, rhs: &DVector<f64>, u: &DVector<f64>) -> f64 {
    solver.apply(x, rhs, u).unwrap().norm()
}

#[test]
fn construction_discovers_patterns() {
    let solver = plane_stress_solver(3, 2);
    let k = solver.stiffness().matrix();
    assert_eq!((k.nrows(), k.ncols()), (16, 16));
    // Multiplier rows carry an explicit zero on the diagonal
    for i in 12..16 {
        assert_eq!(k.get_entry(i, i).unwrap().into_value(), 0.0);
    }
    let d = solver.residual_derivative().matrix();
    assert_eq!((d.nrows(), d.ncols()), (16, 2));
    assert!(solver.stiffness().preconditioner().is_none());
    assert_eq!(solver.state(), &DVector::zeros(16));
}

#[test]
fn solve_state_on_5x5_mesh() {
    let mut solver = plane_stress_solver(5, 5);
    let rhs = tip_load_rhs(solver.assembler(), 1.0);
    let x = DVector::from_fn(solver.num_elements(), |e, _| 0.2 + 0.05 * e as f64);

    let result = solver.solve_state(&x, &rhs).unwrap();
    assert!(result.status.converged);
    assert!(result.status.iterations > 0);
    assert!(result.status.residual_norm <= 1e-10 * rhs.norm());
    assert_eq!(&result.solution, solver.state());
    assert!(residual_norm(&mut solver, &x, &rhs, &result.solution) < 1e-8);
}

#[test]
fn solution_matches_dense_solve() {
    let mut solver = plane_stress_solver(4, 3);
    let rhs = tip_load_rhs(solver.assembler(), 2.0);
    let x = DVector::repeat(solver.num_elements(), 0.5);
    let u = solver.solve_state(&x, &rhs).unwrap().solution;

    let dense = solver.stiffness().triplets().to_dense();
    let expected = dense.lu().solve(&rhs).unwrap();
    assert!((&u - &expected).norm() <= 1e-6 * expected.norm());
}

#[test]
fn warm_start_converges_immediately() {
    let mut solver = plane_stress_solver(5, 5);
    let rhs = tip_load_rhs(solver.assembler(), 1.0);
    let x = DVector::repeat(solver.num_elements(), 1.0);

    let first = solver.solve_state(&x, &rhs).unwrap();
    let second = solver.solve_state(&x, &rhs).unwrap();
    assert!(first.status.iterations > 0);
    assert_eq!(second.status.iterations, 0);
    assert!(second.status.converged);
    assert_eq!(first.solution, second.solution);
}

#[test]
fn non_convergence_is_reported_as_status() {
    let settings = SolverSettings {
        tolerance: 1e-15,
        restart: 1,
        max_iterations: Some(1),
        ..SolverSettings::default()
    };
    let mut solver = EquilibriumSolver::new(cantilever_assembler(5, 5), settings).unwrap();
    let rhs = tip_load_rhs(solver.assembler(), 1.0);
    let x = DVector::repeat(solver.num_elements(), 1.0);

    let result = solver.solve_state(&x, &rhs).unwrap();
    assert!(!result.status.converged);
    assert_eq!(result.status.iterations, 1);
    // The best iterate is kept as the state
    assert_eq!(solver.state(), &result.solution);
    assert!(result.status.residual_norm < rhs.norm());
}

#[test]
fn forward_and_reverse_agree_for_symmetric_assembly() {
    let mut solver = plane_stress_solver(4, 4);
    let x = DVector::from_fn(solver.num_elements(), |e, _| 1.0 - 0.08 * e as f64);
    let rhs = tip_load_rhs(solver.assembler(), 1.0);
    let u = solver.solve_state(&x, &rhs).unwrap().solution;
    solver.linearize(&x, &u, None).unwrap();
    assert!(solver.stiffness().symmetry_defect() < 1e-12);

    let n = solver.state_dim();
    for seed_index in 0..3 {
        let seed = DVector::from_fn(n, |i, _| ((i + 3 * seed_index) as f64).cos());
        let forward = solver.solve_linear(&seed, SolveMode::Forward).unwrap();
        let reverse = solver.solve_linear(&seed, SolveMode::Reverse).unwrap();
        assert!(forward.status.converged && reverse.status.converged);
        let difference = (&forward.solution - &reverse.solution).norm();
        assert!(difference <= 1e-6 * forward.solution.norm());
    }
}

#[test]
fn reverse_solve_uses_true_transpose() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    let x = DVector::from_column_slice(&[1.0, 2.0]);
    let k = MockAssembler::dense(&x);
    solver.linearize(&x, &DVector::zeros(4), None).unwrap();
    assert!(solver.stiffness().symmetry_defect() > 1.0);

    let seed = DVector::from_column_slice(&[1.0, -2.0, 0.5, 3.0]);
    let reverse = solver.solve_linear(&seed, SolveMode::Reverse).unwrap();
    let forward = solver.solve_linear(&seed, SolveMode::Forward).unwrap();

    let expected_reverse = k.transpose().lu().solve(&seed).unwrap();
    let expected_forward = k.lu().solve(&seed).unwrap();
    assert_matrix_eq!(reverse.solution, expected_reverse, comp = abs, tol = 1e-9);
    assert_matrix_eq!(forward.solution, expected_forward, comp = abs, tol = 1e-9);
    assert!((&forward.solution - &reverse.solution).norm() > 1e-3);
}

#[test]
fn solve_linear_with_guess_overwrites_guess() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    let x = DVector::from_column_slice(&[1.0, 1.0]);
    solver.apply(&x, &DVector::zeros(4), &DVector::zeros(4)).unwrap();

    let seed = DVector::from_column_slice(&[1.0, 0.0, 0.0, 0.0]);
    let expected = MockAssembler::dense(&x).transpose().lu().solve(&seed).unwrap();

    let mut guess = expected.clone();
    let status = solver
        .solve_linear_with_guess(&seed, &mut guess, SolveMode::Reverse)
        .unwrap();
    assert_eq!(status.iterations, 0);

    let mut guess = DVector::repeat(4, 10.0);
    let status = solver
        .solve_linear_with_guess(&seed, &mut guess, SolveMode::Reverse)
        .unwrap();
    assert!(status.converged);
    assert_matrix_eq!(guess, expected, comp = abs, tol = 1e-9);
}

#[test]
fn partials_match_finite_differences() {
    let mut solver = plane_stress_solver(3, 3);
    let n = solver.state_dim();
    let num_elements = solver.num_elements();
    let x = DVector::from_column_slice(&[0.9, 0.4, 0.7, 0.3]);
    let u = DVector::from_fn(n, |i, _| 0.1 * (i as f64).sin());
    let rhs = DVector::from_fn(n, |i, _| (i % 3) as f64);

    let h = 1e-6;
    let fd_design = central_difference_jacobian(n, |x| solver.apply(x, &rhs, &u).unwrap(), &x, h);
    let fd_state = central_difference_jacobian(n, |u| solver.apply(&x, &rhs, u).unwrap(), &u, h);
    let fd_rhs = central_difference_jacobian(n, |rhs| solver.apply(&x, rhs, &u).unwrap(), &rhs, h);

    let partials = solver.linearize(&x, &u, None).unwrap();
    assert_eq!((partials.d_design.nrows(), partials.d_design.ncols()), (n, num_elements));
    assert_matrix_eq!(DMatrix::from(partials.d_design), fd_design, comp = abs, tol = 1e-6);
    assert_matrix_eq!(DMatrix::from(partials.d_state), fd_state, comp = abs, tol = 1e-6);
    assert_matrix_eq!(DMatrix::from(partials.d_rhs), fd_rhs, comp = abs, tol = 1e-6);
    assert_eq!(DMatrix::from(partials.d_rhs), -DMatrix::<f64>::identity(n, n));
}

#[test]
fn linearize_rebuilds_preconditioner_and_apply_discards_it() {
    let mut solver = plane_stress_solver(3, 3);
    let n = solver.state_dim();
    let x = DVector::repeat(solver.num_elements(), 1.0);
    let rhs = tip_load_rhs(solver.assembler(), 1.0);

    solver.solve_state(&x, &rhs).unwrap();
    assert!(solver.stiffness().preconditioner().is_some());

    solver.apply(&x, &rhs, &DVector::zeros(n)).unwrap();
    assert!(solver.stiffness().preconditioner().is_none());

    let u = solver.state().clone();
    solver.linearize(&x, &u, None).unwrap();
    assert!(solver.stiffness().preconditioner().is_some());
}

#[test]
fn observer_receives_linearization_inputs() {
    let mut solver = plane_stress_solver(3, 2);
    let x = DVector::from_column_slice(&[0.5, 0.25]);
    let u = DVector::from_fn(16, |i, _| i as f64);

    let mut observed = Vec::new();
    let mut record = |iteration: usize, multipliers: DVectorView<f64>, state: DVectorView<f64>| {
        observed.push((iteration, multipliers.clone_owned(), state.clone_owned()));
    };
    let observer: &mut dyn LinearizationObserver<f64> = &mut record;
    solver.linearize(&x, &u, Some((7, observer))).unwrap();
    solver.linearize(&x, &u, None).unwrap();

    assert_eq!(observed, vec![(7, x.clone(), u.clone())]);
}

#[test]
fn dimension_mismatch_is_detected_before_assembly() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    let calls = assembler.calls.get();

    let x = DVector::repeat(2, 1.0);
    let short = DVector::zeros(3);
    let ok = DVector::zeros(4);

    let err = solver.solve_state(&x, &short).unwrap_err();
    assert!(matches!(
        err,
        EquilibriumError::DimensionMismatch {
            quantity: "rhs",
            expected: 4,
            actual: 3
        }
    ));
    assert!(matches!(
        solver.apply(&DVector::repeat(3, 1.0), &ok, &ok),
        Err(EquilibriumError::DimensionMismatch { quantity: "multipliers", .. })
    ));
    assert!(matches!(
        solver.linearize(&x, &short, None),
        Err(EquilibriumError::DimensionMismatch { quantity: "state", .. })
    ));
    assert!(matches!(
        solver.solve_linear(&short, SolveMode::Reverse),
        Err(EquilibriumError::DimensionMismatch { quantity: "seed", .. })
    ));
    assert!(solver.set_state(&short).is_err());
    assert_eq!(assembler.calls.get(), calls);
}

#[test]
fn changed_indices_are_a_pattern_violation() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    assembler.shift_indices.set(true);

    let x = DVector::repeat(2, 1.0);
    let err = solver.solve_state(&x, &DVector::repeat(4, 1.0)).unwrap_err();
    assert!(matches!(
        err,
        EquilibriumError::PatternViolation {
            matrix: "stiffness",
            entry: 0
        }
    ));
}

#[test]
fn assembly_failures_are_propagated() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    assembler.fail.set(true);

    let x = DVector::repeat(2, 1.0);
    let err = solver.apply(&x, &DVector::zeros(4), &DVector::zeros(4)).unwrap_err();
    assert!(matches!(err, EquilibriumError::Assembly(_)));
    assert!(err.to_string().contains("mock assembly failure"));
}

#[test]
fn failed_solve_leaves_state_unchanged() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    let initial = DVector::from_column_slice(&[1.0, -2.0, 3.0, -4.0]);
    solver.set_state(&initial).unwrap();
    assembler.fail_derivative.set(true);

    let x = DVector::repeat(2, 1.0);
    let err = solver.solve_state(&x, &DVector::repeat(4, 1.0)).unwrap_err();
    assert!(matches!(err, EquilibriumError::Assembly(_)));
    assert!(err.to_string().contains("mock derivative failure"));
    assert_eq!(solver.state(), &initial);
}

#[test]
fn solve_state_leaves_solver_linearized_at_solution() {
    let assembler = MockAssembler::default();
    let mut solver = EquilibriumSolver::new(&assembler, SolverSettings::default()).unwrap();
    let x = DVector::from_column_slice(&[0.7, 1.3]);
    let rhs = DVector::from_column_slice(&[1.0, 0.0, -1.0, 2.0]);

    let u = solver.solve_state(&x, &rhs).unwrap().solution;
    let calls = assembler.calls.get();
    let partials = solver.partials();
    assert_matrix_eq!(DMatrix::from(partials.d_state), MockAssembler::dense(&x), comp = abs, tol = 1e-14);
    let [a, b] = MockAssembler::element_matrices();
    let d_design = DMatrix::from_columns(&[&a * &u, &b * &u]);
    assert_matrix_eq!(DMatrix::from(partials.d_design), d_design, comp = abs, tol = 1e-12);
    assert!(solver.stiffness().preconditioner().is_some());
    assert_eq!(assembler.calls.get(), calls);
}

#[test]
fn single_row_strips_converge() {
    for num_nodes_x in 2..=8 {
        let mut solver = plane_stress_solver(num_nodes_x, 2);
        let rhs = tip_load_rhs(solver.assembler(), 1.0);
        let x = DVector::repeat(solver.num_elements(), 1.0);

        let result = solver.solve_state(&x, &rhs).unwrap();
        assert!(result.status.converged, "{}x2 mesh did not converge", num_nodes_x);
        assert!(residual_norm(&mut solver, &x, &rhs, &result.solution) < 1e-8);

        // apply() discarded the preconditioner, so solve again to inspect it.
        // Every clamped dof exchanges rows with its Lagrange multiplier.
        solver.solve_state(&x, &rhs).unwrap();
        let ilu = solver.stiffness().preconditioner().unwrap();
        let grid = solver.assembler().grid();
        let expected: Vec<_> = (0..grid.num_nodes_y())
            .flat_map(|j| (0..2).map(move |k| (j, k)))
            .map(|(j, k)| (grid.clamped_dof(j, k), grid.lagrange_multiplier_index(j, k)))
            .collect();
        assert_eq!(ilu.row_swaps(), expected.as_slice());
    }
}

#[test]
fn vanishing_multipliers_fail_factorization() {
    let mut solver = plane_stress_solver(3, 2);
    let rhs = tip_load_rhs(solver.assembler(), 1.0);
    let err = solver.solve_state(&DVector::zeros(2), &rhs).unwrap_err();
    // Constraint rows still pivot, but the first free displacement row is empty
    assert!(matches!(err, EquilibriumError::Factorization(FactorizationError::ZeroPivot { row: 4 })));
}

#[test]
fn settings_defaults_and_serialization() {
    let settings = SolverSettings::default();
    assert_eq!(settings.tolerance, 1e-10);
    assert_eq!(settings.restart, 200);
    assert_eq!(settings.drop_tolerance, 1e-12);
    assert_eq!(settings.max_iterations_for(50), 500);

    let json = serde_json::to_string(&settings).unwrap();
    let deserialized: SolverSettings<f64> = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, settings);
}

proptest! {
    #[test]
    fn apply_matches_dense_residual(
        (settings, x, u, rhs) in grid_settings(4).prop_flat_map(|settings| {
            let num_elements = (settings.num_nodes_x - 1) * (settings.num_nodes_y - 1);
            let n = 2 * settings.num_nodes_x * settings.num_nodes_y + 2 * settings.num_nodes_y;
            (Just(settings), multiplier_field(num_elements), dvector(n), dvector(n))
        })
    ) {
        let assembler = PlaneStressAssembler::new(&settings, YoungPoisson::default()).unwrap();
        let mut solver = EquilibriumSolver::new(assembler, SolverSettings::default()).unwrap();

        let residual = solver.apply(&x, &rhs, &u).unwrap();
        let k = solver.stiffness().triplets().to_dense();
        let expected = k * &u - &rhs;
        prop_assert!((residual - expected).amax() <= 1e-10);
    }

    #[test]
    fn solve_state_satisfies_equilibrium(
        (settings, x, rhs) in grid_settings(4).prop_flat_map(|settings| {
            let num_elements = (settings.num_nodes_x - 1) * (settings.num_nodes_y - 1);
            let n = 2 * settings.num_nodes_x * settings.num_nodes_y + 2 * settings.num_nodes_y;
            (Just(settings), multiplier_field(num_elements), dvector(n))
        })
    ) {
        let assembler = PlaneStressAssembler::new(&settings, YoungPoisson::default()).unwrap();
        let mut solver = EquilibriumSolver::new(assembler, SolverSettings::default()).unwrap();

        let result = solver.solve_state(&x, &rhs).unwrap();
        prop_assert!(result.status.converged);
        let residual = solver.apply(&x, &rhs, &result.solution).unwrap();
        prop_assert!(residual.norm() <= 1e-8 * rhs.norm().max(1.0));
    }
}
