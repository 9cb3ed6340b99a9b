use anyhow::{Context, Result};
use frcn_train::config::Config;
use std::{env, path::PathBuf};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Train a Fast R-CNN model
struct Args {
    #[structopt(long, default_value = "train.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(long)]
    /// initialize the network with these weights
    pub pretrained_model: Option<PathBuf>,
    #[structopt(long)]
    /// number of iterations to train
    pub max_iters: Option<usize>,
    #[structopt(long)]
    /// directory where snapshots are saved
    pub output_dir: Option<PathBuf>,
}

pub fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    let Args {
        config_file,
        pretrained_model,
        max_iters,
        output_dir,
    } = Args::from_args();
    let mut config = Config::open(&config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;

    if let Some(path) = pretrained_model {
        config.pretrained_model = Some(path);
    }
    if let Some(max_iters) = max_iters {
        config.max_iters = max_iters;
    }
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    info!("Output will be saved to '{}'", config.output_dir.display());

    // start training program
    let snapshots = frcn_train::train_from_config(&config)?;
    info!("{} snapshots written", snapshots.len());

    Ok(())
}
