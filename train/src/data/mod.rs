//! Region-of-interest database handling.

mod bbox_targets;
mod data_layer;
mod filter;
mod roidb;

pub use bbox_targets::*;
pub use data_layer::*;
pub use filter::*;
pub use roidb::*;
