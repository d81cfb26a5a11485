//! Sparse linear algebra used by the `fem2d` equilibrium solver.
//!
//! The crate is deliberately small: a restarted GMRES solver operating on anything that
//! implements [`LinearOperator`], an incomplete LU preconditioner over CSR matrices,
//! and helpers for assembling CSR matrices with a fixed sparsity pattern from triplets.
use nalgebra::RealField;

pub use nalgebra;
pub use nalgebra_sparse;

pub mod gmres;
pub mod ilu;
pub mod triplets;

pub use gmres::{IdentityOperator, LinearOperator, Transpose};
pub use ilu::{FactorizationError, IncompleteLu};
pub use triplets::{TripletScatter, Triplets};

pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}
