//! Misc utilities.

mod bbox;
mod lr_scheduler;
mod timer;

pub use bbox::*;
pub use lr_scheduler::*;
pub use timer::*;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";
