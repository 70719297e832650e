//! Configuration of the RPN trainer, read from a json5 file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::dataset::data_transformers::gtsdb::SuperCategory;
use crate::rpn_nn::anchor_targets::MatchThresholds;
use crate::rpn_nn::rpn_loss::RpnLoss;
use crate::rpn_nn::DEVICE;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub anchors: AnchorConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub proposals: ProposalConfig,
}

impl Config {
    pub fn open<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Config::from_json5(&text)
    }

    pub fn from_json5(text: &str) -> anyhow::Result<Self> {
        let config: Config = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let anchors = &self.anchors;
        ensure!(!anchors.sizes.is_empty(), "anchors.sizes must not be empty");
        ensure!(!anchors.ratios.is_empty(), "anchors.ratios must not be empty");
        ensure!(
            anchors.sizes.iter().chain(&anchors.ratios).all(|v| *v > 0.),
            "anchor sizes and ratios must be positive"
        );
        ensure!(
            anchors.neg_iou_threshold <= anchors.pos_iou_threshold,
            "neg_iou_threshold ({}) is above pos_iou_threshold ({})",
            anchors.neg_iou_threshold,
            anchors.pos_iou_threshold
        );
        ensure!(
            (0. ..=1.).contains(&anchors.positive_fraction),
            "positive_fraction must be within [0, 1]"
        );
        ensure!(
            (0. ..1.).contains(&self.dataset.val_fraction),
            "val_fraction must be within [0, 1)"
        );
        ensure!(
            self.dataset.image_width > 0 && self.dataset.image_height > 0,
            "image size must not be zero"
        );
        ensure!(self.training.batch_size > 0, "batch_size must not be zero");
        ensure!(
            self.model.pools as usize <= self.model.channels.len(),
            "model.pools ({}) exceeds the number of backbone blocks ({})",
            self.model.pools,
            self.model.channels.len()
        );
        Ok(())
    }
}

/// GTSDB location and preprocessing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory holding the images and the ground truth file
    pub dir: PathBuf,
    pub gt_file: String,
    pub image_extension: String,
    /// Images are resized to this before entering the network
    pub image_width: u32,
    pub image_height: u32,
    pub val_fraction: f64,
    pub split_seed: u64,
    pub class_whitelist: Option<HashSet<u32>>,
    pub super_categories: Option<Vec<SuperCategory>>,
    pub shuffle_buffer: usize,
    pub hflip_prob: f64,
    /// Max absolute brightness change, 0 disables it
    pub brightness_jitter: i32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            dir: PathBuf::from("GTSDB"),
            gt_file: "gt.txt".to_string(),
            image_extension: "ppm".to_string(),
            image_width: 680,
            image_height: 400,
            val_fraction: 0.1,
            split_seed: 42,
            class_whitelist: None,
            super_categories: None,
            shuffle_buffer: 64,
            hflip_prob: 0.5,
            brightness_jitter: 20,
        }
    }
}

impl DatasetConfig {
    /// (height, width) of the network input
    pub fn image_size(&self) -> (i64, i64) {
        (self.image_height as i64, self.image_width as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Square root of the anchor areas, in network input pixels
    pub sizes: Vec<f64>,
    /// height / width
    pub ratios: Vec<f64>,
    pub pos_iou_threshold: f64,
    pub neg_iou_threshold: f64,
    pub allowed_border: f64,
    pub samples_per_image: usize,
    pub positive_fraction: f64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        AnchorConfig {
            sizes: vec![16., 32., 64.],
            ratios: vec![0.5, 1., 2.],
            pos_iou_threshold: 0.7,
            neg_iou_threshold: 0.3,
            allowed_border: 0.,
            samples_per_image: 256,
            positive_fraction: 0.5,
        }
    }
}

impl AnchorConfig {
    pub fn nb_anchors(&self) -> i64 {
        (self.sizes.len() * self.ratios.len()) as i64
    }

    pub fn thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            pos_iou_threshold: self.pos_iou_threshold,
            neg_iou_threshold: self.neg_iou_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Output channels of each conv block of the backbone
    pub channels: Vec<i64>,
    /// The first `pools` blocks are followed by a 2x2 max pool
    pub pools: u32,
    pub head_channels: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            channels: vec![16, 32, 64, 128],
            pools: 3,
            head_channels: 128,
        }
    }
}

impl ModelConfig {
    /// Input pixels per feature map cell
    pub fn stride(&self) -> i64 {
        1 << self.pools
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceConfig {
    /// First CUDA device when available
    Auto,
    Cpu,
    Cuda { index: usize },
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig::Auto
    }
}

impl DeviceConfig {
    pub fn device(&self) -> Device {
        match *self {
            DeviceConfig::Auto => *DEVICE,
            DeviceConfig::Cpu => Device::Cpu,
            DeviceConfig::Cuda { index } => Device::Cuda(index),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub device: DeviceConfig,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub loss: RpnLoss,
    pub checkpoint_dir: PathBuf,
    /// Continue from the most recent checkpoint in `checkpoint_dir`
    pub resume: bool,
    pub reduce_lr: Option<ReduceLrConfig>,
    pub early_stopping_patience: Option<usize>,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            device: DeviceConfig::Auto,
            batch_size: 4,
            epochs: 50,
            learning_rate: 1e-4,
            loss: RpnLoss::default(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            resume: true,
            reduce_lr: Some(ReduceLrConfig::default()),
            early_stopping_patience: Some(10),
            seed: 0,
        }
    }
}

/// Learning rate decay when the validation loss stops improving
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrConfig {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
}

impl Default for ReduceLrConfig {
    fn default() -> Self {
        ReduceLrConfig {
            factor: 0.5,
            patience: 3,
            min_lr: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalConfig {
    pub pre_nms_top_n: usize,
    pub post_nms_top_n: usize,
    pub nms_iou_threshold: f64,
    /// Proposals narrower or shorter than this are dropped
    pub min_size: f64,
    pub score_threshold: f64,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        ProposalConfig {
            pre_nms_top_n: 2000,
            post_nms_top_n: 300,
            nms_iou_threshold: 0.7,
            min_size: 4.,
            score_threshold: 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config = Config::from_json5(
            r#"{
                // comments are fine in json5
                dataset: { dir: "/data/FullIJCNN2013", image_width: 1360, image_height: 800 },
                anchors: { sizes: [24, 48] },
                training: { device: { kind: "cuda", index: 1 }, epochs: 3 },
            }"#,
        )
        .unwrap();

        assert_eq!(config.dataset.dir, PathBuf::from("/data/FullIJCNN2013"));
        assert_eq!(config.dataset.image_size(), (800, 1360));
        assert_eq!(config.dataset.gt_file, "gt.txt");
        assert_eq!(config.anchors.sizes, vec![24., 48.]);
        assert_eq!(config.anchors.nb_anchors(), 6);
        assert_eq!(config.training.device, DeviceConfig::Cuda { index: 1 });
        assert_eq!(config.training.device.device(), Device::Cuda(1));
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.model, ModelConfig::default());
        assert_eq!(config.model.stride(), 8);
    }

    #[test]
    fn sample_config_file_matches_defaults() {
        let config = Config::open(Path::new(env!("CARGO_MANIFEST_DIR")).join("rpn.json5")).unwrap();
        assert_eq!(config.model, ModelConfig::default());
        assert_eq!(config.proposals, ProposalConfig::default());
        assert_eq!(config.training.reduce_lr, Some(ReduceLrConfig::default()));
        assert_eq!(config.training.early_stopping_patience, Some(10));
        assert_eq!(config.dataset.super_categories, None);
    }

    #[test]
    fn empty_config_is_valid() {
        let config = Config::from_json5("{}").unwrap();
        assert_eq!(config.training.device, DeviceConfig::Auto);
        assert_eq!(config.proposals, ProposalConfig::default());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let result = Config::from_json5(
            "{ anchors: { pos_iou_threshold: 0.2, neg_iou_threshold: 0.5 } }",
        );
        assert!(result.is_err());
    }

    #[test]
    fn too_many_pools_are_rejected() {
        let result = Config::from_json5("{ model: { channels: [8, 16], pools: 3 } }");
        assert!(result.is_err());
    }
}
