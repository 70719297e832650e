//! Epoch loop of the RPN trainer.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::ensure;
use log::{debug, info, warn};
use tch::nn::{self, OptimizerConfig};
use tch::{Device, Tensor};

use crate::config::Config;
use crate::dataset::batch_generator::{
    AnchorTargetBuilder, GeneratorOptions, RpnBatch, RpnBatchGenerator,
};
use crate::dataset::common_structs::ImgFilenameWithBboxes;
use crate::dataset::data_augmenters::image_augmentations::Augmenter;
use crate::dataset::data_loaders::gtsdb_dataset_loader::GtsdbDataLoader;
use crate::dataset::data_transformers::gtsdb::{filter_classes, load_labels, train_val_split};
use crate::rpn_nn::checkpoint::{
    ensure_no_previous_run, find_best_checkpoint, find_latest_checkpoint, HISTORY_FILENAME,
};
use crate::rpn_nn::network::RpnNetwork;
use crate::rpn_nn::rpn_loss::{RpnLoss, RpnLossOutput};

pub mod callbacks;

use callbacks::{CsvHistory, EarlyStopping, EpochRecord, ModelCheckpoint, ReduceLrOnPlateau};

/// Mean losses over the batches of an epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLoss {
    pub total: f64,
    pub cls: f64,
    pub reg: f64,
}

#[derive(Debug, Default)]
struct LossMeter {
    total: f64,
    cls: f64,
    reg: f64,
    nb_batches: usize,
}

impl LossMeter {
    fn add(&mut self, losses: &RpnLossOutput) {
        self.total += losses.total.double_value(&[]);
        self.cls += losses.cls.double_value(&[]);
        self.reg += losses.reg.double_value(&[]);
        self.nb_batches += 1;
    }

    /// None when no batch was seen
    fn mean(&self) -> Option<EpochLoss> {
        if self.nb_batches == 0 {
            return None;
        }
        let n = self.nb_batches as f64;
        Some(EpochLoss {
            total: self.total / n,
            cls: self.cls / n,
            reg: self.reg / n,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epochs trained by this call, resumed epochs excluded
    pub epochs_run: usize,
    pub best_loss: f64,
    pub best_checkpoint: PathBuf,
    pub stopped_early: bool,
}

fn batch_loss(
    network: &RpnNetwork,
    batch: &RpnBatch,
    loss: &RpnLoss,
    device: Device,
    train: bool,
) -> anyhow::Result<RpnLossOutput> {
    let output = network.forward_t(&batch.images.to_device(device), train)?;
    ensure!(
        output.cls_logits.size() == batch.labels.size(),
        "network predicts {:?} anchors but targets have {:?}, check the model and image sizes",
        output.cls_logits.size(),
        batch.labels.size()
    );
    Ok(loss.forward(
        &output.cls_logits,
        &output.deltas,
        &batch.labels.to_device(device),
        &batch.reg_targets.to_device(device),
    ))
}

fn train_epoch(
    network: &RpnNetwork,
    opt: &mut nn::Optimizer,
    generator: RpnBatchGenerator,
    loss: &RpnLoss,
    device: Device,
    epoch: usize,
) -> anyhow::Result<Option<EpochLoss>> {
    let nb_batches = generator.nb_batches();
    let mut meter = LossMeter::default();
    for (index, batch) in generator.enumerate() {
        let batch = batch?;
        let losses = batch_loss(network, &batch, loss, device, true)?;
        opt.backward_step(&losses.total);
        meter.add(&losses);
        if (index + 1) % 10 == 0 || index + 1 == nb_batches {
            debug!(
                "epoch {} batch {}/{} loss {:.4}",
                epoch,
                index + 1,
                nb_batches,
                losses.total.double_value(&[])
            );
        }
    }
    Ok(meter.mean())
}

fn evaluate(
    network: &RpnNetwork,
    generator: RpnBatchGenerator,
    loss: &RpnLoss,
    device: Device,
) -> anyhow::Result<Option<EpochLoss>> {
    tch::no_grad(|| {
        let mut meter = LossMeter::default();
        for batch in generator {
            let losses = batch_loss(network, &batch?, loss, device, false)?;
            meter.add(&losses);
        }
        Ok(meter.mean())
    })
}

/// Feeds the losses of already trained epochs to the callbacks so their patience
/// counters pick up where they stopped. Returns the learning rate of the next epoch.
fn replay_history(
    history: &[EpochRecord],
    reduce_lr: &mut Option<ReduceLrOnPlateau>,
    early_stopping: &mut Option<EarlyStopping>,
    learning_rate: f64,
) -> f64 {
    for record in history {
        if let Some(reduce_lr) = reduce_lr.as_mut() {
            reduce_lr.on_epoch_end(record.val_loss, record.learning_rate);
        }
        if let Some(early_stopping) = early_stopping.as_mut() {
            early_stopping.on_epoch_end(record.val_loss);
        }
    }
    history
        .last()
        .map_or(learning_rate, |record| record.next_learning_rate)
}

/// Loads, filters and splits the labels of the configured dataset
pub fn load_split(
    config: &Config,
) -> anyhow::Result<(Vec<ImgFilenameWithBboxes>, Vec<ImgFilenameWithBboxes>)> {
    let dataset = &config.dataset;
    let labels = load_labels(&dataset.dir, &dataset.gt_file, &dataset.image_extension)?;
    let labels = filter_classes(
        labels,
        dataset.class_whitelist.as_ref(),
        dataset.super_categories.as_deref(),
    );
    let nb_signs: usize = labels.iter().map(|label| label.bboxes.len()).sum();
    let (train, val) = train_val_split(labels, dataset.val_fraction, dataset.split_seed);
    info!(
        "{} signs in {} training and {} validation images",
        nb_signs,
        train.len(),
        val.len()
    );
    Ok((train, val))
}

/// Trains the RPN described by `config`, resuming from its checkpoint dir when asked to
pub fn train(config: &Config) -> anyhow::Result<TrainingSummary> {
    let training = &config.training;
    let dataset = &config.dataset;
    let device = training.device.device();
    info!("training on {:?}", device);

    let (train_labels, val_labels) = load_split(config)?;
    ensure!(!train_labels.is_empty(), "no training images left after the split");
    if val_labels.is_empty() {
        warn!("no validation images, monitoring the training loss instead");
    }

    let targets = AnchorTargetBuilder::from_config(config);
    info!(
        "{} anchors per image of {}x{}",
        targets.anchors().size()[0],
        dataset.image_width,
        dataset.image_height
    );

    let mut vs = nn::VarStore::new(device);
    let network = RpnNetwork::new(&vs.root(), &config.model, config.anchors.nb_anchors())?;

    let history_path = training.checkpoint_dir.join(HISTORY_FILENAME);
    let mut checkpoint = ModelCheckpoint::new(&training.checkpoint_dir)?;
    let mut reduce_lr = training.reduce_lr.map(ReduceLrOnPlateau::new);
    let mut early_stopping = training.early_stopping_patience.map(EarlyStopping::new);
    let mut learning_rate = training.learning_rate;
    let mut start_epoch = 0;
    let latest = if training.resume {
        find_latest_checkpoint(&training.checkpoint_dir)?
    } else {
        None
    };
    match latest {
        Some(latest) => {
            vs.load(&latest.path)?;
            start_epoch = latest.epoch + 1;
            if let Some(best) = find_best_checkpoint(&training.checkpoint_dir)? {
                checkpoint = checkpoint.with_best(best.val_loss);
            }
            if history_path.exists() {
                let resumed: Vec<EpochRecord> = callbacks::read_history(&history_path)?
                    .into_iter()
                    .filter(|record| record.epoch < start_epoch)
                    .collect();
                learning_rate = replay_history(
                    &resumed,
                    &mut reduce_lr,
                    &mut early_stopping,
                    learning_rate,
                );
            }
            info!(
                "resuming from {} at epoch {} with learning rate {:e}",
                latest.path.display(),
                start_epoch,
                learning_rate
            );
        }
        None => ensure_no_previous_run(&training.checkpoint_dir)?,
    }

    let mut opt = nn::Adam::default().build(&vs, learning_rate)?;
    let mut history = CsvHistory::open(&history_path)?;
    let augmenter = Augmenter {
        hflip_prob: dataset.hflip_prob,
        brightness_jitter: dataset.brightness_jitter,
    };

    let mut summary = TrainingSummary {
        epochs_run: 0,
        best_loss: checkpoint.best_loss(),
        best_checkpoint: checkpoint.best_path(),
        stopped_early: false,
    };

    for epoch in start_epoch..training.epochs {
        let start = Instant::now();
        let train_generator = RpnBatchGenerator::new(
            GtsdbDataLoader::new(
                &dataset.dir,
                train_labels.clone(),
                dataset.image_width,
                dataset.image_height,
            ),
            &targets,
            GeneratorOptions {
                batch_size: training.batch_size,
                shuffle_buffer: Some(dataset.shuffle_buffer.max(1)),
                augmenter: Some(augmenter),
                seed: training.seed.wrapping_add(epoch as u64),
            },
        )?;
        let val_generator = RpnBatchGenerator::new(
            GtsdbDataLoader::new(
                &dataset.dir,
                val_labels.clone(),
                dataset.image_width,
                dataset.image_height,
            ),
            &targets,
            GeneratorOptions {
                batch_size: training.batch_size,
                shuffle_buffer: None,
                augmenter: None,
                seed: training.seed,
            },
        )?;

        let train_loss = train_epoch(
            &network,
            &mut opt,
            train_generator,
            &training.loss,
            device,
            epoch,
        )?
        .ok_or_else(|| anyhow::anyhow!("epoch {} saw no training batch", epoch))?;
        let val_loss = evaluate(&network, val_generator, &training.loss, device)?
            .unwrap_or(train_loss);

        let seconds = start.elapsed().as_secs_f64();
        info!(
            "epoch {}/{} train loss {:.4} (cls {:.4} reg {:.4}) val loss {:.4} (cls {:.4} reg {:.4}) in {:.1}s",
            epoch + 1,
            training.epochs,
            train_loss.total,
            train_loss.cls,
            train_loss.reg,
            val_loss.total,
            val_loss.cls,
            val_loss.reg,
            seconds
        );

        let saved = checkpoint.on_epoch_end(&vs, epoch, val_loss.total)?;
        debug!("saved {}", saved.display());
        summary.epochs_run += 1;
        summary.best_loss = checkpoint.best_loss();

        let epoch_learning_rate = learning_rate;
        if let Some(reduce_lr) = reduce_lr.as_mut() {
            if let Some(new_lr) = reduce_lr.on_epoch_end(val_loss.total, learning_rate) {
                info!("reducing learning rate from {:e} to {:e}", learning_rate, new_lr);
                learning_rate = new_lr;
                opt.set_lr(learning_rate);
            }
        }
        let stop = early_stopping
            .as_mut()
            .map_or(false, |early_stopping| early_stopping.on_epoch_end(val_loss.total));

        history.append(&EpochRecord {
            epoch,
            learning_rate: epoch_learning_rate,
            next_learning_rate: learning_rate,
            train_loss: train_loss.total,
            train_cls_loss: train_loss.cls,
            train_reg_loss: train_loss.reg,
            val_loss: val_loss.total,
            val_cls_loss: val_loss.cls,
            val_reg_loss: val_loss.reg,
            seconds,
        })?;

        if stop {
            info!("no improvement for a while, stopping after epoch {}", epoch + 1);
            summary.stopped_early = true;
            break;
        }
    }

    Ok(summary)
}

/// Loads trained weights for inference
pub fn load_network<P: AsRef<Path>>(
    config: &Config,
    weights: P,
) -> anyhow::Result<(nn::VarStore, RpnNetwork)> {
    let mut vs = nn::VarStore::new(config.training.device.device());
    let network = RpnNetwork::new(&vs.root(), &config.model, config.anchors.nb_anchors())?;
    vs.load(weights.as_ref())?;
    Ok((vs, network))
}

/// Single image [3, H, W] forward pass, returns ([N] logits, [N, 4] deltas)
pub fn predict(
    network: &RpnNetwork,
    image: &Tensor,
    device: Device,
) -> anyhow::Result<(Tensor, Tensor)> {
    let output = tch::no_grad(|| network.forward_t(&image.unsqueeze(0).to_device(device), false))?;
    Ok((output.cls_logits.squeeze_dim(0), output.deltas.squeeze_dim(0)))
}
