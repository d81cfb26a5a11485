//! Sparse assembly of the stiffness matrix and of its design derivative.
use crate::element::{ElementStiffness, RectangleQ4Element};
use crate::materials::YoungPoisson;
use crate::mesh::{GridSettings, RectangularGrid};
use crate::quadrature::gauss_2d;
use crate::Real;
use eyre::eyre;
use fem2d_sparse::Triplets;
use log::debug;
use nalgebra::DVectorView;

/// Produces the entries of a design-dependent stiffness matrix at fixed sparsity locations.
///
/// The assembled matrix `K(x)` enters the equilibrium residual `R(x, u) = K(x) u - f`, where
/// `x` holds one multiplier per element. Implementations must write the same row and column
/// indices on every call, so that callers can discover the sparsity pattern once and only
/// update values afterwards. Duplicate index pairs are allowed and are summed.
pub trait StiffnessAssembler<T: Real> {
    fn num_elements(&self) -> usize;

    fn state_dim(&self) -> usize;

    /// Number of triplets written by [`assemble_stiffness_into`](Self::assemble_stiffness_into).
    fn stiffness_nnz(&self) -> usize;

    /// Number of triplets written by
    /// [`assemble_stiffness_derivative_into`](Self::assemble_stiffness_derivative_into).
    fn derivative_nnz(&self) -> usize;

    /// Writes the triplets of the `state_dim x state_dim` matrix `K(x)`.
    fn assemble_stiffness_into(&self, output: &mut Triplets<T>, multipliers: DVectorView<T>) -> eyre::Result<()>;

    /// Writes the triplets of the `state_dim x num_elements` matrix `dR/dx` evaluated at `state`.
    ///
    /// Since `R` is linear in `x`, this matrix does not depend on the multipliers.
    fn assemble_stiffness_derivative_into(&self, output: &mut Triplets<T>, state: DVectorView<T>) -> eyre::Result<()>;
}

impl<'a, T, A> StiffnessAssembler<T> for &'a A
where
    T: Real,
    A: ?Sized + StiffnessAssembler<T>,
{
    fn num_elements(&self) -> usize {
        A::num_elements(self)
    }

    fn state_dim(&self) -> usize {
        A::state_dim(self)
    }

    fn stiffness_nnz(&self) -> usize {
        A::stiffness_nnz(self)
    }

    fn derivative_nnz(&self) -> usize {
        A::derivative_nnz(self)
    }

    fn assemble_stiffness_into(&self, output: &mut Triplets<T>, multipliers: DVectorView<T>) -> eyre::Result<()> {
        A::assemble_stiffness_into(self, output, multipliers)
    }

    fn assemble_stiffness_derivative_into(&self, output: &mut Triplets<T>, state: DVectorView<T>) -> eyre::Result<()> {
        A::assemble_stiffness_derivative_into(self, output, state)
    }
}

fn check_output_shape<T>(output: &Triplets<T>, nrows: usize, ncols: usize, nnz: usize) -> eyre::Result<()> {
    if output.nrows() != nrows || output.ncols() != ncols || output.len() != nnz {
        return Err(eyre!(
            "Output triplets have shape {}x{} with {} entries, expected {}x{} with {} entries",
            output.nrows(),
            output.ncols(),
            output.len(),
            nrows,
            ncols,
            nnz
        ));
    }
    Ok(())
}

fn check_input_len(name: &str, actual: usize, expected: usize) -> eyre::Result<()> {
    if actual != expected {
        return Err(eyre!("{} has length {}, expected {}", name, actual, expected));
    }
    Ok(())
}

/// Linear elastic plane stress assembly on a [`RectangularGrid`], clamped at `x = 0`.
///
/// Each element contributes `x_e K_e`, where `K_e` is the Q4 stiffness of a cell computed with
/// 2x2 Gauss quadrature and unit thickness. All cells are congruent, so `K_e` is computed once.
///
/// Each displacement component `d` of a node on the left edge is constrained to the value found
/// in the trailing part of the right-hand side through a Lagrange multiplier `m`, which adds
/// the symmetric pair of unit entries `(m, d)` and `(d, m)`.
#[derive(Debug, Clone)]
pub struct PlaneStressAssembler<T: Real> {
    grid: RectangularGrid<T>,
    material: YoungPoisson<T>,
    element_stiffness: ElementStiffness<T>,
}

impl<T: Real> PlaneStressAssembler<T> {
    pub fn new(grid_settings: &GridSettings<T>, material: YoungPoisson<T>) -> eyre::Result<Self> {
        let grid = RectangularGrid::new(grid_settings)?;
        Self::from_grid(grid, material)
    }

    pub fn from_grid(grid: RectangularGrid<T>, material: YoungPoisson<T>) -> eyre::Result<Self> {
        material.validate()?;
        let h = grid.cell_size();
        let element = RectangleQ4Element::new(h.x, h.y);
        let quadrature = gauss_2d(2)?;
        let element_stiffness = element.stiffness(&material.plane_stress_elasticity(), &quadrature);
        debug!(
            "Plane stress assembler on {}x{} node grid ({} elements, state dimension {})",
            grid.num_nodes_x(),
            grid.num_nodes_y(),
            grid.num_elements(),
            grid.state_dim()
        );
        Ok(Self {
            grid,
            material,
            element_stiffness,
        })
    }

    pub fn grid(&self) -> &RectangularGrid<T> {
        &self.grid
    }

    pub fn material(&self) -> &YoungPoisson<T> {
        &self.material
    }

    /// Stiffness of a single cell with unit multiplier.
    pub fn element_stiffness(&self) -> &ElementStiffness<T> {
        &self.element_stiffness
    }
}

impl<T: Real> StiffnessAssembler<T> for PlaneStressAssembler<T> {
    fn num_elements(&self) -> usize {
        self.grid.num_elements()
    }

    fn state_dim(&self) -> usize {
        self.grid.state_dim()
    }

    fn stiffness_nnz(&self) -> usize {
        64 * self.grid.num_elements() + 2 * self.grid.num_clamped_dofs()
    }

    fn derivative_nnz(&self) -> usize {
        64 * self.grid.num_elements()
    }

    fn assemble_stiffness_into(&self, output: &mut Triplets<T>, multipliers: DVectorView<T>) -> eyre::Result<()> {
        let n = self.state_dim();
        check_output_shape(output, n, n, self.stiffness_nnz())?;
        check_input_len("Multiplier field", multipliers.len(), self.num_elements())?;

        let (rows, cols, values) = output.parts_mut();
        let ke = &self.element_stiffness;
        for e in 0..self.grid.num_elements() {
            let dofs = self.grid.element_dofs(e);
            let x_e = multipliers[e];
            for r in 0..8 {
                for c in 0..8 {
                    let idx = 64 * e + 8 * r + c;
                    rows[idx] = dofs[r];
                    cols[idx] = dofs[c];
                    values[idx] = x_e * ke[(r, c)];
                }
            }
        }

        let mut idx = 64 * self.grid.num_elements();
        for j in 0..self.grid.num_nodes_y() {
            for k in 0..2 {
                let d = self.grid.clamped_dof(j, k);
                let m = self.grid.lagrange_multiplier_index(j, k);
                for (row, col) in [(m, d), (d, m)] {
                    rows[idx] = row;
                    cols[idx] = col;
                    values[idx] = T::one();
                    idx += 1;
                }
            }
        }
        Ok(())
    }

    fn assemble_stiffness_derivative_into(&self, output: &mut Triplets<T>, state: DVectorView<T>) -> eyre::Result<()> {
        check_output_shape(output, self.state_dim(), self.num_elements(), self.derivative_nnz())?;
        check_input_len("State", state.len(), self.state_dim())?;

        let (rows, cols, values) = output.parts_mut();
        let ke = &self.element_stiffness;
        for e in 0..self.grid.num_elements() {
            let dofs = self.grid.element_dofs(e);
            for r in 0..8 {
                for c in 0..8 {
                    let idx = 64 * e + 8 * r + c;
                    rows[idx] = dofs[r];
                    cols[idx] = e;
                    values[idx] = ke[(r, c)] * state[dofs[c]];
                }
            }
        }
        Ok(())
    }
}
