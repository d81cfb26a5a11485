//! Compliance and adjoint sensitivities of a clamped cantilever with a tip load.
//!
//! Usage: `cargo run --release --example cantilever [num_nodes_x] [num_nodes_y]`
use eyre::eyre;
use fem2d::assembly::PlaneStressAssembler;
use fem2d::materials::YoungPoisson;
use fem2d::mesh::GridSettings;
use fem2d::simp::ComplianceProblem;
use fem2d::solver::{EquilibriumSolver, SolverSettings};
use nalgebra::DVector;
use std::time::Instant;

fn parse_arg(args: &[String], index: usize, default: usize) -> eyre::Result<usize> {
    match args.get(index) {
        Some(arg) => arg
            .parse()
            .map_err(|err| eyre!("Invalid argument {:?}: {}", arg, err)),
        None => Ok(default),
    }
}

fn main() -> eyre::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let grid_settings = GridSettings::<f64> {
        num_nodes_x: parse_arg(&args, 1, 81)?,
        num_nodes_y: parse_arg(&args, 2, 41)?,
        ..GridSettings::default()
    };
    let penalty = 3.0;
    let density = 0.5;

    let assembler = PlaneStressAssembler::new(&grid_settings, YoungPoisson::default())?;
    let grid = *assembler.grid();
    let solver = EquilibriumSolver::new(assembler, SolverSettings::default())?;

    let mut forces = DVector::zeros(grid.num_displacement_dofs());
    let tip = grid.node_index(grid.num_nodes_x() - 1, 0);
    forces[2 * tip + 1] = -1.0;
    let mut problem = ComplianceProblem::new(solver, forces, penalty)?;

    println!(
        "Cantilever {}x{} nodes: {} elements, state dimension {}",
        grid.num_nodes_x(),
        grid.num_nodes_y(),
        grid.num_elements(),
        grid.state_dim()
    );

    let design = DVector::repeat(grid.num_elements(), density);
    for label in ["cold", "warm"] {
        let start = Instant::now();
        let evaluation = problem.evaluate(&design, None)?;
        println!(
            "{} evaluation in {:.3?}: compliance {:.6e}, |dc/dx| {:.6e}, volume fraction {:.3}",
            label,
            start.elapsed(),
            evaluation.compliance,
            evaluation.gradient.norm(),
            evaluation.volume_fraction
        );
        println!(
            "    forward: {} iterations (converged: {}), adjoint: {} iterations (converged: {})",
            evaluation.state_status.iterations,
            evaluation.state_status.converged,
            evaluation.adjoint_status.iterations,
            evaluation.adjoint_status.converged
        );
    }

    Ok(())
}
