use fem2d::assembly::{PlaneStressAssembler, StiffnessAssembler};
use fem2d::materials::YoungPoisson;
use fem2d::mesh::GridSettings;
use fem2d::simp::{compliance, ComplianceProblem};
use fem2d::solver::{EquilibriumSolver, SolveMode, SolverSettings};
use nalgebra::DVector;

fn assembler(num_nodes_x: usize, num_nodes_y: usize, length_x: f64, length_y: f64) -> PlaneStressAssembler<f64> {
    let settings = GridSettings {
        num_nodes_x,
        num_nodes_y,
        length_x,
        length_y,
    };
    PlaneStressAssembler::new(&settings, YoungPoisson::default()).unwrap()
}

#[test]
fn clamped_two_element_cantilever_under_tip_load() {
    let assembler = assembler(3, 2, 2.0, 1.0);
    assert_eq!(assembler.state_dim(), 16);
    let grid = *assembler.grid();
    let mut solver = EquilibriumSolver::new(assembler, SolverSettings::default()).unwrap();

    let x = DVector::repeat(grid.num_elements(), 1.0);
    let mut rhs = DVector::zeros(16);
    let tip = grid.node_index(2, 0);
    rhs[2 * tip + 1] = -1.0;

    let result = solver.solve_state(&x, &rhs).unwrap();
    assert!(result.status.converged);
    let u = &result.solution;

    for j in 0..grid.num_nodes_y() {
        for k in 0..2 {
            assert!(u[grid.clamped_dof(j, k)].abs() < 1e-10);
        }
    }
    assert!(u[2 * tip + 1] < 0.0);
    assert!(solver.apply(&x, &rhs, u).unwrap().norm() < 1e-8);

    // Summing the vertical equilibrium rows cancels the stiffness terms,
    // so the multipliers add up to the applied load
    let vertical_multipliers: f64 = (0..grid.num_nodes_y())
        .map(|j| u[grid.lagrange_multiplier_index(j, 1)])
        .sum();
    assert!((vertical_multipliers + 1.0).abs() < 1e-8);
}

#[test]
fn stiffer_design_deflects_less() {
    let assembler = assembler(9, 5, 2.0, 1.0);
    let grid = *assembler.grid();
    let mut solver = EquilibriumSolver::new(assembler, SolverSettings::default()).unwrap();

    let mut rhs = DVector::zeros(grid.state_dim());
    let tip = grid.node_index(grid.num_nodes_x() - 1, 0);
    rhs[2 * tip + 1] = -1.0;

    let soft = DVector::repeat(grid.num_elements(), 0.5);
    let stiff = DVector::repeat(grid.num_elements(), 1.0);
    let u_soft = solver.solve_state(&soft, &rhs).unwrap().solution;
    let u_stiff = solver.solve_state(&stiff, &rhs).unwrap().solution;

    // Uniformly scaling the stiffness scales the displacements inversely
    let displacements = grid.num_displacement_dofs();
    let scaled = u_soft.rows(0, displacements) * 0.5;
    assert!((scaled - u_stiff.rows(0, displacements)).norm() <= 1e-7 * u_stiff.norm());
    assert!(u_stiff[2 * tip + 1] < 0.0);
}

#[test]
fn adjoint_of_compliance_equals_state_for_symmetric_system() {
    let assembler = assembler(7, 4, 3.0, 1.0);
    let grid = *assembler.grid();
    let mut solver = EquilibriumSolver::new(assembler, SolverSettings::default()).unwrap();

    let x = DVector::from_fn(grid.num_elements(), |e, _| 0.3 + 0.7 * ((e % 5) as f64) / 4.0);
    let mut rhs = DVector::zeros(grid.state_dim());
    let tip = grid.node_index(grid.num_nodes_x() - 1, grid.num_nodes_y() / 2);
    rhs[2 * tip + 1] = -1.0;

    let u = solver.solve_state(&x, &rhs).unwrap().solution;
    solver.linearize(&x, &u, None).unwrap();
    let adjoint = solver.solve_linear(&rhs, SolveMode::Reverse).unwrap();
    assert!(adjoint.status.converged);
    assert!((&adjoint.solution - &u).norm() <= 1e-6 * u.norm());

    let forces = rhs.rows(0, grid.num_displacement_dofs()).clone_owned();
    let c = compliance((&forces).into(), (&u).into());
    assert!(c > 0.0);
}

#[test]
fn repeated_compliance_evaluations_reuse_state() {
    let assembler = assembler(11, 6, 2.0, 1.0);
    let grid = *assembler.grid();
    let solver = EquilibriumSolver::new(assembler, SolverSettings::default()).unwrap();

    let mut forces = DVector::zeros(grid.num_displacement_dofs());
    let tip = grid.node_index(grid.num_nodes_x() - 1, 0);
    forces[2 * tip + 1] = -1.0;
    let mut problem = ComplianceProblem::new(solver, forces, 3.0).unwrap();

    let design = DVector::repeat(grid.num_elements(), 0.5);
    let first = problem.evaluate(&design, None).unwrap();
    let second = problem.evaluate(&design, None).unwrap();
    assert!(first.state_status.iterations > 0);
    assert_eq!(second.state_status.iterations, 0);
    assert_eq!(first.compliance, second.compliance);

    // A small step along the negative gradient reduces compliance
    let step = &first.gradient * (-1e-3 / first.gradient.amax());
    let improved = problem.evaluate(&(design + step), None).unwrap();
    assert!(improved.compliance < first.compliance);
}
