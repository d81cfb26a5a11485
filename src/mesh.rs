//! Structured rectangular grids of bilinear quadrilaterals.
use crate::Real;
use eyre::eyre;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Geometric description of a structured rectangular grid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSettings<T> {
    pub num_nodes_x: usize,
    pub num_nodes_y: usize,
    pub length_x: T,
    pub length_y: T,
}

impl Default for GridSettings<f64> {
    fn default() -> Self {
        Self {
            num_nodes_x: 81,
            num_nodes_y: 41,
            length_x: 2.0,
            length_y: 1.0,
        }
    }
}

/// A uniform grid of `(nx - 1) x (ny - 1)` rectangular cells covering `[0, Lx] x [0, Ly]`.
///
/// Node `(ix, iy)` sits at `(ix * hx, iy * hy)` and has the global index `ix * ny + iy`.
/// Its displacement degrees of freedom are `2 * node` (x) and `2 * node + 1` (y).
/// Cell `(ix, iy)` has the index `ix * (ny - 1) + iy`.
///
/// The state vector of the equilibrium system additionally carries one Lagrange multiplier per
/// displacement component of each node on the left edge `x = 0`, stored after all
/// displacement degrees of freedom.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RectangularGrid<T> {
    num_nodes_x: usize,
    num_nodes_y: usize,
    length_x: T,
    length_y: T,
}

impl<T: Real> RectangularGrid<T> {
    pub fn new(settings: &GridSettings<T>) -> eyre::Result<Self> {
        let &GridSettings {
            num_nodes_x,
            num_nodes_y,
            length_x,
            length_y,
        } = settings;
        if num_nodes_x < 2 || num_nodes_y < 2 {
            return Err(eyre!(
                "grid needs at least 2 nodes per direction, got {}x{}",
                num_nodes_x,
                num_nodes_y
            ));
        }
        if !(length_x > T::zero() && length_y > T::zero()) {
            return Err(eyre!("grid lengths must be positive, got {} x {}", length_x, length_y));
        }
        Ok(Self {
            num_nodes_x,
            num_nodes_y,
            length_x,
            length_y,
        })
    }

    pub fn settings(&self) -> GridSettings<T> {
        GridSettings {
            num_nodes_x: self.num_nodes_x,
            num_nodes_y: self.num_nodes_y,
            length_x: self.length_x,
            length_y: self.length_y,
        }
    }

    /// Side lengths `(hx, hy)` of every cell.
    pub fn cell_size(&self) -> Vector2<T> {
        let cells_x = T::from_usize(self.num_nodes_x - 1).expect("Must be able to fit usize in T");
        let cells_y = T::from_usize(self.num_nodes_y - 1).expect("Must be able to fit usize in T");
        Vector2::new(self.length_x / cells_x, self.length_y / cells_y)
    }

    pub fn node_position(&self, ix: usize, iy: usize) -> Point2<T> {
        let h = self.cell_size();
        let ix = T::from_usize(ix).expect("Must be able to fit usize in T");
        let iy = T::from_usize(iy).expect("Must be able to fit usize in T");
        Point2::new(ix * h.x, iy * h.y)
    }
}

impl<T> RectangularGrid<T> {
    pub fn num_nodes_x(&self) -> usize {
        self.num_nodes_x
    }

    pub fn num_nodes_y(&self) -> usize {
        self.num_nodes_y
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes_x * self.num_nodes_y
    }

    pub fn num_elements(&self) -> usize {
        (self.num_nodes_x - 1) * (self.num_nodes_y - 1)
    }

    /// Number of displacement degrees of freedom, `2 * nx * ny`.
    pub fn num_displacement_dofs(&self) -> usize {
        2 * self.num_nodes()
    }

    /// Number of clamped displacement components on the left edge, `2 * ny`.
    pub fn num_clamped_dofs(&self) -> usize {
        2 * self.num_nodes_y
    }

    /// Total length of the state vector: displacements followed by Lagrange multipliers.
    pub fn state_dim(&self) -> usize {
        self.num_displacement_dofs() + self.num_clamped_dofs()
    }

    pub fn node_index(&self, ix: usize, iy: usize) -> usize {
        debug_assert!(ix < self.num_nodes_x && iy < self.num_nodes_y);
        ix * self.num_nodes_y + iy
    }

    pub fn element_index(&self, ix: usize, iy: usize) -> usize {
        debug_assert!(ix + 1 < self.num_nodes_x && iy + 1 < self.num_nodes_y);
        ix * (self.num_nodes_y - 1) + iy
    }

    /// Global node indices of a cell in counter-clockwise order, starting at the lower left node.
    pub fn element_nodes(&self, element_index: usize) -> [usize; 4] {
        let cells_y = self.num_nodes_y - 1;
        let (ix, iy) = (element_index / cells_y, element_index % cells_y);
        [
            self.node_index(ix, iy),
            self.node_index(ix + 1, iy),
            self.node_index(ix + 1, iy + 1),
            self.node_index(ix, iy + 1),
        ]
    }

    /// Global degrees of freedom of a cell, ordered `[x0, y0, x1, y1, ...]` by local node.
    pub fn element_dofs(&self, element_index: usize) -> [usize; 8] {
        let nodes = self.element_nodes(element_index);
        let mut dofs = [0; 8];
        for (local, node) in nodes.iter().enumerate() {
            dofs[2 * local] = 2 * node;
            dofs[2 * local + 1] = 2 * node + 1;
        }
        dofs
    }

    /// Displacement degree of freedom of component `k` of the `j`-th left edge node.
    pub fn clamped_dof(&self, j: usize, k: usize) -> usize {
        2 * self.node_index(0, j) + k
    }

    /// State index of the Lagrange multiplier enforcing [`clamped_dof(j, k)`](Self::clamped_dof).
    pub fn lagrange_multiplier_index(&self, j: usize, k: usize) -> usize {
        debug_assert!(j < self.num_nodes_y && k < 2);
        self.num_displacement_dofs() + 2 * j + k
    }
}
