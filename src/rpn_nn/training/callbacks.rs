//! End of epoch hooks of the trainer.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};
use tch::nn;

use crate::config::ReduceLrConfig;
use crate::rpn_nn::checkpoint::{checkpoint_filename, BEST_CHECKPOINT_FILENAME};

/// Tracks the lowest loss seen so far. NaN never counts as an improvement.
#[derive(Debug, Clone, Copy)]
struct Plateau {
    best: f64,
    wait: usize,
}

impl Plateau {
    fn new() -> Self {
        Plateau {
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// true when `loss` improved on the best loss
    fn update(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }
}

#[derive(Debug)]
pub struct ModelCheckpoint {
    dir: PathBuf,
    plateau: Plateau,
}

impl ModelCheckpoint {
    pub fn new<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir '{}'", dir.display()))?;
        Ok(ModelCheckpoint {
            dir,
            plateau: Plateau::new(),
        })
    }

    /// Starts from an already known best loss, e.g. after resuming
    pub fn with_best(mut self, best_loss: f64) -> Self {
        self.plateau.best = best_loss;
        self
    }

    pub fn best_loss(&self) -> f64 {
        self.plateau.best
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT_FILENAME)
    }

    /// Saves the weights of this epoch, plus the best weights when `val_loss` improved.
    /// Returns the path of the epoch checkpoint.
    pub fn on_epoch_end(
        &mut self,
        vs: &nn::VarStore,
        epoch: usize,
        val_loss: f64,
    ) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(checkpoint_filename(epoch, val_loss));
        vs.save(&path)
            .with_context(|| format!("failed to save '{}'", path.display()))?;
        if self.plateau.update(val_loss) {
            info!("validation loss improved to {:.4}, saving best weights", val_loss);
            vs.save(self.best_path())?;
        }
        Ok(path)
    }
}

#[derive(Debug)]
pub struct ReduceLrOnPlateau {
    config: ReduceLrConfig,
    plateau: Plateau,
}

impl ReduceLrOnPlateau {
    pub fn new(config: ReduceLrConfig) -> Self {
        ReduceLrOnPlateau {
            config,
            plateau: Plateau::new(),
        }
    }

    /// The new learning rate when it has to change
    pub fn on_epoch_end(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if self.plateau.update(val_loss) || self.plateau.wait < self.config.patience {
            return None;
        }
        self.plateau.wait = 0;
        let new_lr = (current_lr * self.config.factor).max(self.config.min_lr);
        if new_lr < current_lr {
            Some(new_lr)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct EarlyStopping {
    patience: usize,
    plateau: Plateau,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        EarlyStopping {
            patience,
            plateau: Plateau::new(),
        }
    }

    /// true when training should stop
    pub fn on_epoch_end(&mut self, val_loss: f64) -> bool {
        !self.plateau.update(val_loss) && self.plateau.wait >= self.patience
    }
}

/// One row of the training history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Rate used during the epoch
    pub learning_rate: f64,
    /// Rate after the end of epoch callbacks, the one a resumed run starts with
    pub next_learning_rate: f64,
    pub train_loss: f64,
    pub train_cls_loss: f64,
    pub train_reg_loss: f64,
    pub val_loss: f64,
    pub val_cls_loss: f64,
    pub val_reg_loss: f64,
    pub seconds: f64,
}

/// Appends one [EpochRecord] per epoch to a CSV file
pub struct CsvHistory {
    writer: csv::Writer<File>,
}

impl CsvHistory {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let has_rows = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open history file '{}'", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!has_rows)
            .from_writer(file);
        Ok(CsvHistory { writer })
    }

    pub fn append(&mut self, record: &EpochRecord) -> anyhow::Result<()> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn read_history<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<EpochRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader.deserialize().collect::<Result<Vec<EpochRecord>, _>>()?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_lr_waits_for_patience() {
        let mut reduce = ReduceLrOnPlateau::new(ReduceLrConfig {
            factor: 0.5,
            patience: 2,
            min_lr: 0.1,
        });
        assert_eq!(reduce.on_epoch_end(1.0, 1.), None);
        assert_eq!(reduce.on_epoch_end(1.1, 1.), None);
        assert_eq!(reduce.on_epoch_end(1.2, 1.), Some(0.5));
        assert_eq!(reduce.on_epoch_end(0.9, 0.5), None);
        assert_eq!(reduce.on_epoch_end(f64::NAN, 0.5), None);
        assert_eq!(reduce.on_epoch_end(1.0, 0.5), Some(0.25));
        assert_eq!(reduce.on_epoch_end(1.0, 0.25), None);
        assert_eq!(reduce.on_epoch_end(1.0, 0.25), Some(0.125));
        assert_eq!(reduce.on_epoch_end(1.0, 0.1), None);
        // already at min_lr
        assert_eq!(reduce.on_epoch_end(1.0, 0.1), None);
    }

    #[test]
    fn early_stopping_after_patience_epochs_without_improvement() {
        let mut stopping = EarlyStopping::new(2);
        assert!(!stopping.on_epoch_end(1.));
        assert!(!stopping.on_epoch_end(0.5));
        assert!(!stopping.on_epoch_end(0.7));
        assert!(stopping.on_epoch_end(0.6));
    }

    #[test]
    fn history_appends_with_a_single_header() {
        let path = std::env::temp_dir().join(format!("gtsdb_rpn_history_{}.csv", std::process::id()));
        let _ = fs::remove_file(&path);
        let record = |epoch| EpochRecord {
            epoch,
            learning_rate: 1e-3,
            next_learning_rate: 5e-4,
            train_loss: 1.,
            train_cls_loss: 0.5,
            train_reg_loss: 0.5,
            val_loss: 0.8,
            val_cls_loss: 0.4,
            val_reg_loss: 0.4,
            seconds: 2.,
        };

        CsvHistory::open(&path).unwrap().append(&record(0)).unwrap();
        CsvHistory::open(&path).unwrap().append(&record(1)).unwrap();

        let history = read_history(&path).unwrap();
        assert_eq!(history, vec![record(0), record(1)]);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("epoch").count(), 1);
        fs::remove_file(&path).unwrap();
    }
}
