//! Training program configuration format.

use crate::common::*;

pub use network::*;
pub use solver::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub solver: SolverConfig,
    pub training: TrainingConfig,
    pub network: NetworkConfig,
    /// Layer-to-layer parameter copies applied after loading pretrained weights.
    #[serde(default)]
    pub weight_transfer: Vec<WeightTransfer>,
    pub dataset: DatasetConfig,
    /// The directory where snapshots are written.
    pub output_dir: PathBuf,
    /// Optional weights file loaded before training.
    pub pretrained_model: Option<PathBuf>,
    /// The iteration at which training stops.
    pub max_iters: usize,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let TrainingConfig {
            fg_thresh,
            bg_thresh_lo,
            bg_thresh_hi,
            fg_fraction,
            ims_per_batch,
            batch_size,
            ref scales,
            ..
        } = self.training;

        ensure!(
            bg_thresh_lo <= bg_thresh_hi,
            "bg_thresh_lo must not exceed bg_thresh_hi"
        );
        ensure!(
            (0.0..=1.0).contains(&fg_thresh.raw()),
            "fg_thresh must be within [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&fg_fraction.raw()),
            "fg_fraction must be within [0, 1]"
        );
        ensure!(
            batch_size.get() % ims_per_batch.get() == 0,
            "batch_size must be multiple of ims_per_batch"
        );
        ensure!(!scales.is_empty(), "scales must not be empty");
        ensure!(
            self.network.num_classes >= 2,
            "num_classes must include background and at least one object class"
        );
        ensure!(
            !self.solver.snapshot_prefix.is_empty(),
            "snapshot_prefix must not be empty"
        );
        if let BBoxNormalization::Precomputed { means, stds } = &self.training.bbox_normalization
        {
            ensure!(
                stds.iter().all(|std| *std > 0.0),
                "precomputed stds must be positive, but get {:?} (means {:?})",
                stds,
                means
            );
        }

        Ok(())
    }
}

/// A single `source -> destination` parameter copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightTransfer {
    pub src: String,
    pub dst: String,
}

impl WeightTransfer {
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

/// Dataset options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// The JSON file listing roidb records.
    pub roidb_file: PathBuf,
    /// If set, relative image paths in the roidb are resolved against it.
    pub image_dir: Option<PathBuf>,
}

mod solver {
    use super::*;

    /// The solver options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SolverConfig {
        /// Learning rate policy.
        pub lr_policy: LearningRatePolicy,
        pub momentum: R64,
        pub weight_decay: R64,
        /// Log the smoothed loss every this many iterations. Zero disables it.
        pub display: usize,
        /// The number of recent losses averaged for display.
        #[serde(default = "default_average_loss")]
        pub average_loss: NonZeroUsize,
        /// The file name prefix of snapshots.
        pub snapshot_prefix: String,
        #[serde(
            with = "tch_serde::serde_device",
            default = "default_device"
        )]
        pub device: Device,
        /// If set, seeds the framework and the data layer.
        pub random_seed: Option<u64>,
    }

    /// The learning rate policy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRatePolicy {
        /// Use constant learning rate.
        Fixed { base_lr: R64 },
        /// Multiply the rate by `gamma` every `step_size` iterations.
        Step {
            base_lr: R64,
            gamma: R64,
            step_size: NonZeroUsize,
        },
        /// Multiply the rate by `gamma` at each of the given iterations.
        MultiStep {
            base_lr: R64,
            gamma: R64,
            step_values: Vec<usize>,
        },
    }

    fn default_average_loss() -> NonZeroUsize {
        NonZeroUsize::new(1).unwrap()
    }

    fn default_device() -> Device {
        Device::cuda_if_available()
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// Overlap threshold for a RoI to be considered foreground.
        pub fg_thresh: R64,
        /// Overlap range `[bg_thresh_lo, bg_thresh_hi)` of background RoIs.
        pub bg_thresh_lo: R64,
        pub bg_thresh_hi: R64,
        /// If set, train and unnormalize bounding-box regressors.
        pub bbox_reg: bool,
        /// Overlap required between a RoI and a ground-truth box to be used as
        /// a regression example.
        pub bbox_thresh: R64,
        /// Regression target normalization method.
        pub bbox_normalization: BBoxNormalization,
        /// Save a snapshot every this many iterations. Zero disables it.
        pub snapshot_iters: usize,
        /// Inserted into snapshot file names when non-empty.
        #[serde(default)]
        pub snapshot_infix: String,
        /// Append horizontally flipped copies of every image.
        pub use_flipped: bool,
        /// Images per minibatch.
        pub ims_per_batch: NonZeroUsize,
        /// RoIs per minibatch.
        pub batch_size: NonZeroUsize,
        /// The maximum fraction of foreground RoIs in a minibatch.
        pub fg_fraction: R64,
        /// Candidate lengths of the shortest image side.
        pub scales: Vec<usize>,
        /// The maximum length of the longest image side.
        pub max_size: usize,
    }

    /// Regression target normalization method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum BBoxNormalization {
        /// Keep raw targets. Unnormalization uses zero means and unit stds.
        Disabled,
        /// Compute per-class statistics from the roidb.
        Computed,
        /// Use fixed statistics shared by all classes.
        Precomputed { means: [f32; 4], stds: [f32; 4] },
    }
}

mod network {
    use super::*;

    /// The Fast R-CNN network options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct NetworkConfig {
        /// Number of classes including background.
        pub num_classes: usize,
        /// If set, adds the context branch pooling enlarged RoIs.
        pub context_scale: Option<R64>,
        /// Layers whose parameters receive no updates.
        #[serde(default)]
        pub frozen_layers: Vec<String>,
        /// The bounding-box regression layer unnormalized on snapshot.
        #[serde(default = "default_bbox_pred_layer")]
        pub bbox_pred_layer: String,
        /// Dropout ratio of the fully connected layers.
        #[serde(default = "default_dropout")]
        pub dropout: R64,
    }

    fn default_bbox_pred_layer() -> String {
        "bbox_pred".into()
    }

    fn default_dropout() -> R64 {
        r64(0.5)
    }
}
