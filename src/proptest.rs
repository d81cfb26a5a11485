//! Strategies for property-based testing.
use crate::mesh::GridSettings;
use ::proptest::collection::vec;
use ::proptest::prelude::*;
use nalgebra::DVector;

/// Small grids with 2 to `max_nodes` nodes per direction and lengths in `[0.5, 4]`.
pub fn grid_settings(max_nodes: usize) -> impl Strategy<Value = GridSettings<f64>> {
    let nodes = 2..=max_nodes.max(2);
    (nodes.clone(), nodes, 0.5..4.0, 0.5..4.0).prop_map(|(num_nodes_x, num_nodes_y, length_x, length_y)| {
        GridSettings {
            num_nodes_x,
            num_nodes_y,
            length_x,
            length_y,
        }
    })
}

/// Strictly positive multipliers, as produced by penalizing admissible densities.
pub fn multiplier_field(num_elements: usize) -> impl Strategy<Value = DVector<f64>> {
    vec(0.01..=1.0, num_elements).prop_map(DVector::from_vec)
}

pub fn dvector(len: usize) -> impl Strategy<Value = DVector<f64>> {
    // Keep magnitudes moderate so that residual comparisons can use absolute tolerances
    vec(-10.0..10.0, len).prop_map(DVector::from_vec)
}
