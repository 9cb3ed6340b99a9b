//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Result};
pub use chrono::Local;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    vision, Device, Kind, Tensor,
};
pub use tracing::{debug, info, warn};
