//! Turns loaded GTSDB samples into RPN training batches.

use anyhow::ensure;
use image::{DynamicImage, GenericImageView};
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::{Kind, Tensor};

use crate::config::{AnchorConfig, Config, ModelConfig};
use crate::dataset::common_structs::SignBbox;
use crate::dataset::data_augmenters::image_augmentations::Augmenter;
use crate::dataset::data_loaders::gtsdb_dataset_loader::GtsdbDataLoader;
use crate::dataset::data_transformers::img2tensor::from_img_to_normalized_tensor;
use crate::dataset::iterator_adapters::*;
use crate::dataset::DataLoader;
use crate::rpn_nn::anchor_targets::{
    anchors_vs_gt, sample_anchors, AnchorTargets, MatchThresholds, POSITIVE,
};
use crate::rpn_nn::anchors::{feature_size, filter_boxes, get_anchors};

pub type Sample = (DynamicImage, Vec<SignBbox>);

/// [M, 4] corner tensor of the boxes, M may be 0
pub fn bboxes_to_tensor(bboxes: &[SignBbox]) -> Tensor {
    let flat: Vec<f32> = bboxes.iter().flat_map(|bb| bb.corners()).collect();
    Tensor::from_slice(&flat).view([bboxes.len() as i64, 4])
}

/// Holds the anchors of the network input size and labels images against them
#[derive(Debug)]
pub struct AnchorTargetBuilder {
    image_size: (i64, i64),
    anchors: Tensor,
    inside: Tensor,
    thresholds: MatchThresholds,
    samples_per_image: usize,
    positive_fraction: f64,
}

impl AnchorTargetBuilder {
    pub fn new(image_size: (i64, i64), model: &ModelConfig, anchors: &AnchorConfig) -> Self {
        let features = feature_size(image_size, model.pools);
        let all_anchors = get_anchors(features, model.stride(), &anchors.sizes, &anchors.ratios);
        let inside = filter_boxes(&all_anchors, image_size, anchors.allowed_border);
        let nb_inside = inside.sum(Kind::Int64).int64_value(&[]);
        if nb_inside == 0 {
            warn!(
                "all {} anchors cross the border of a {:?} image, nothing will be learned",
                all_anchors.size()[0],
                image_size
            );
        }
        AnchorTargetBuilder {
            image_size,
            anchors: all_anchors,
            inside,
            thresholds: anchors.thresholds(),
            samples_per_image: anchors.samples_per_image,
            positive_fraction: anchors.positive_fraction,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        AnchorTargetBuilder::new(config.dataset.image_size(), &config.model, &config.anchors)
    }

    /// [N, 4] anchors in `get_anchors` order
    pub fn anchors(&self) -> &Tensor {
        &self.anchors
    }

    /// (height, width) the anchors were laid out for
    pub fn image_size(&self) -> (i64, i64) {
        self.image_size
    }

    /// Labels and regression targets of one image, already subsampled
    pub fn build<R: Rng + ?Sized>(
        &self,
        bboxes: &[SignBbox],
        rng: &mut R,
    ) -> anyhow::Result<AnchorTargets> {
        let gt_boxes = bboxes_to_tensor(bboxes);
        let targets = anchors_vs_gt(&self.anchors, &gt_boxes, &self.inside, self.thresholds);
        let labels = sample_anchors(
            &targets.labels,
            self.samples_per_image,
            self.positive_fraction,
            rng,
        )?;
        let dropped = labels.ne(POSITIVE).unsqueeze(1);
        let reg_targets = targets.reg_targets.masked_fill(&dropped, 0.);
        Ok(AnchorTargets {
            labels,
            reg_targets,
        })
    }
}

/// One training step worth of data, on CPU
#[derive(Debug)]
pub struct RpnBatch {
    /// [B, 3, H, W] in [0, 1]
    pub images: Tensor,
    /// [B, N] i64
    pub labels: Tensor,
    /// [B, N, 4]
    pub reg_targets: Tensor,
    pub gt_boxes: Vec<Vec<SignBbox>>,
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorOptions {
    pub batch_size: usize,
    /// None keeps the loader order
    pub shuffle_buffer: Option<usize>,
    pub augmenter: Option<Augmenter>,
    pub seed: u64,
}

/// Iterator of [RpnBatch] over a [GtsdbDataLoader]
pub struct RpnBatchGenerator<'a> {
    batches: Box<dyn Iterator<Item = Vec<anyhow::Result<Sample>>>>,
    targets: &'a AnchorTargetBuilder,
    augmenter: Option<Augmenter>,
    rng: StdRng,
    nb_batches: usize,
}

impl<'a> RpnBatchGenerator<'a> {
    pub fn new(
        loader: GtsdbDataLoader,
        targets: &'a AnchorTargetBuilder,
        options: GeneratorOptions,
    ) -> anyhow::Result<Self> {
        ensure!(options.batch_size > 0, "batch_size must not be zero");
        let nb_batches = (loader.max_elem_index() + options.batch_size - 1) / options.batch_size;
        let batches: Box<dyn Iterator<Item = Vec<anyhow::Result<Sample>>>> =
            match options.shuffle_buffer {
                Some(buffer) => Box::new(
                    loader
                        .shuffling(buffer, StdRng::seed_from_u64(options.seed))
                        .dataset_batching(options.batch_size),
                ),
                None => Box::new(loader.dataset_batching(options.batch_size)),
            };
        Ok(RpnBatchGenerator {
            batches,
            targets,
            augmenter: options.augmenter,
            rng: StdRng::seed_from_u64(options.seed.wrapping_add(1)),
            nb_batches,
        })
    }

    pub fn nb_batches(&self) -> usize {
        self.nb_batches
    }

    fn build_batch(&mut self, samples: Vec<anyhow::Result<Sample>>) -> anyhow::Result<RpnBatch> {
        let (height, width) = self.targets.image_size();
        let mut images = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        let mut reg_targets = Vec::with_capacity(samples.len());
        let mut gt_boxes = Vec::with_capacity(samples.len());

        for sample in samples {
            let (img, bboxes) = sample?;
            let (img, bboxes) = match &self.augmenter {
                Some(augmenter) => augmenter.augment(img, bboxes, &mut self.rng),
                None => (img, bboxes),
            };
            ensure!(
                img.dimensions() == (width as u32, height as u32),
                "image is {:?} but anchors were laid out for {}x{}",
                img.dimensions(),
                width,
                height
            );
            let targets = self.targets.build(&bboxes, &mut self.rng)?;
            images.push(from_img_to_normalized_tensor(&img));
            labels.push(targets.labels);
            reg_targets.push(targets.reg_targets);
            gt_boxes.push(bboxes);
        }

        Ok(RpnBatch {
            images: Tensor::f_stack(&images, 0)?,
            labels: Tensor::f_stack(&labels, 0)?,
            reg_targets: Tensor::f_stack(&reg_targets, 0)?,
            gt_boxes,
        })
    }
}

impl<'a> Iterator for RpnBatchGenerator<'a> {
    type Item = anyhow::Result<RpnBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let samples = self.batches.next()?;
        Some(self.build_batch(samples))
    }
}
