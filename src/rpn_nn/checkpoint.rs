use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

lazy_static! {
    static ref CHECKPOINT_FILENAME: Regex =
        Regex::new(r"^rpn_epoch(\d+)_val([^_]+)\.ot$").expect("valid checkpoint regex");
}

/// Weights of the epoch with the lowest validation loss so far
pub const BEST_CHECKPOINT_FILENAME: &str = "rpn_best.ot";

pub const HISTORY_FILENAME: &str = "history.csv";

pub fn checkpoint_filename(epoch: usize, val_loss: f64) -> String {
    format!("rpn_epoch{:04}_val{:.4}.ot", epoch, val_loss)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointFile {
    pub path: PathBuf,
    pub epoch: usize,
    pub val_loss: f64,
}

/// Every epoch checkpoint in `dir`, files with other names are skipped
pub fn list_checkpoints<P: AsRef<Path>>(dir: P) -> anyhow::Result<Vec<CheckpointFile>> {
    let pattern = dir.as_ref().join("*.ot");
    let pattern = pattern
        .to_str()
        .with_context(|| format!("non UTF-8 checkpoint path '{}'", pattern.display()))?;

    let mut checkpoints = vec![];
    for entry in glob::glob(pattern)? {
        let path = entry?;
        let parsed = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| CHECKPOINT_FILENAME.captures(name))
            .and_then(|captures| {
                let epoch = captures.get(1)?.as_str().parse().ok()?;
                let val_loss = captures.get(2)?.as_str().parse().ok()?;
                Some((epoch, val_loss))
            });
        match parsed {
            Some((epoch, val_loss)) => checkpoints.push(CheckpointFile {
                path,
                epoch,
                val_loss,
            }),
            None => debug!("ignoring {}", path.display()),
        }
    }
    Ok(checkpoints)
}

/// Checkpoint of the highest epoch in `dir`
pub fn find_latest_checkpoint<P: AsRef<Path>>(dir: P) -> anyhow::Result<Option<CheckpointFile>> {
    Ok(list_checkpoints(dir)?
        .into_iter()
        .max_by_key(|checkpoint| checkpoint.epoch))
}

/// Checkpoint with the lowest validation loss in `dir`, NaN losses never win
pub fn find_best_checkpoint<P: AsRef<Path>>(dir: P) -> anyhow::Result<Option<CheckpointFile>> {
    Ok(list_checkpoints(dir)?
        .into_iter()
        .filter(|checkpoint| !checkpoint.val_loss.is_nan())
        .min_by(|a, b| a.val_loss.total_cmp(&b.val_loss)))
}

/// Fails when `dir` already holds the checkpoints or the history of another run,
/// so a fresh run never mixes its epochs with stale ones. Empty files do not count.
pub fn ensure_no_previous_run<P: AsRef<Path>>(dir: P) -> anyhow::Result<()> {
    let dir = dir.as_ref();
    let nb_checkpoints = list_checkpoints(dir)?.len();
    let stale_files: Vec<String> = [BEST_CHECKPOINT_FILENAME, HISTORY_FILENAME]
        .iter()
        .filter(|name| {
            dir.join(name)
                .metadata()
                .map_or(false, |metadata| metadata.len() > 0)
        })
        .map(|name| name.to_string())
        .collect();
    ensure!(
        nb_checkpoints == 0 && stale_files.is_empty(),
        "'{}' holds a previous run ({} epoch checkpoints, {:?}), resume it or pick another checkpoint_dir",
        dir.display(),
        nb_checkpoints,
        stale_files
    );
    Ok(())
}
