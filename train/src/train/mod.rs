//! Solvers and the training loop.

mod solver;
mod wrapper;

pub use solver::*;
pub use wrapper::*;
