use std::path::PathBuf;

use anyhow::{Context, Result};
use gtsdb_rpn::config::Config;
use gtsdb_rpn::rpn_nn::training::train;
use log::info;
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
/// Train the traffic sign region proposal network
struct Args {
    #[structopt(long, default_value = "rpn.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(long)]
    /// overrides the number of epochs of the configuration file
    pub epochs: Option<usize>,
}

fn main() -> Result<()> {
    gtsdb_rpn::init_logging();

    let Args {
        config_file,
        epochs,
    } = Args::from_args();
    let mut config = Config::open(&config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }

    let summary = train(&config)?;
    info!(
        "trained {} epochs, best loss {:.4} saved to {}",
        summary.epochs_run,
        summary.best_loss,
        summary.best_checkpoint.display()
    );
    Ok(())
}
