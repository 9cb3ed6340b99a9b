//! The Fast R-CNN training program.

pub mod common;
pub mod config;
pub mod data;
pub mod model;
pub mod params;
pub mod train;
pub mod utils;

use crate::{
    common::*,
    config::{Config, SolverConfig},
    data::{
        filter_roidb, get_training_roidb, load_roidb, RoiDataLayerInit, RoiThresholds, RoidbEntry,
    },
    model::FastRcnnNetInit,
    train::{SgdSolver, Solver, SolverWrapper},
};

/// Filters the roidb, builds the solver wrapper and trains up to `max_iters`.
///
/// Returns the paths of the written snapshots.
pub fn train_net<S, F>(
    config: &Config,
    roidb: Vec<RoidbEntry>,
    output_dir: &Path,
    pretrained_model: Option<&Path>,
    max_iters: usize,
    build_solver: F,
) -> Result<Vec<PathBuf>>
where
    S: Solver,
    F: FnOnce(&SolverConfig) -> Result<S>,
{
    let roidb = filter_roidb(roidb, &RoiThresholds::from(&config.training));
    ensure!(!roidb.is_empty(), "no roidb entry is left after filtering");

    let mut wrapper = SolverWrapper::new(
        config,
        roidb,
        output_dir,
        pretrained_model,
        build_solver,
    )?;

    info!("Solving...");
    let snapshots = wrapper.train_model(max_iters)?;
    info!("done solving");

    Ok(snapshots)
}

/// The entry of training program.
pub fn train_from_config(config: &Config) -> Result<Vec<PathBuf>> {
    let start_time = Local::now();
    let output_dir = &config.output_dir;

    // create dirs and save config
    {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(format!(
            "config-{}.json5",
            start_time.format(utils::FILE_STRFTIME)
        ));
        let text = serde_json::to_string_pretty(config)?;
        fs::write(&path, text)?;
    }

    // load dataset
    info!("loading roidb from '{}'", config.dataset.roidb_file.display());
    let records = load_roidb(&config.dataset.roidb_file)?;
    let roidb = get_training_roidb(records, config.training.use_flipped)?;
    info!("{} roidb entries", roidb.len());

    let num_classes = config.network.num_classes;
    let build_solver = |solver_config: &SolverConfig| {
        let data_layer = RoiDataLayerInit::from_config(
            &config.training,
            num_classes,
            config.dataset.image_dir.clone(),
            solver_config.random_seed,
            solver_config.device,
        )
        .build()?;

        SgdSolver::new(solver_config, &config.network.frozen_layers, |path| {
            FastRcnnNetInit::vgg16(&config.network).build(path, data_layer)
        })
    };

    train_net(
        config,
        roidb,
        output_dir,
        config.pretrained_model.as_deref(),
        config.max_iters,
        build_solver,
    )
}
