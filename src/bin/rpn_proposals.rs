use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gtsdb_rpn::config::Config;
use gtsdb_rpn::dataset::batch_generator::AnchorTargetBuilder;
use gtsdb_rpn::dataset::common_structs::{ImgFilenameWithBboxes, SignBbox};
use gtsdb_rpn::dataset::data_transformers::img2tensor::{
    from_img_to_normalized_tensor, resize_with_bboxes,
};
use gtsdb_rpn::rpn_nn::checkpoint::BEST_CHECKPOINT_FILENAME;
use gtsdb_rpn::rpn_nn::helpers::img_drawing::{
    draw_bbs_to_img, draw_proposals_to_img, GT_COLOR, PROPOSAL_COLOR,
};
use gtsdb_rpn::rpn_nn::network::RpnNetwork;
use gtsdb_rpn::rpn_nn::proposals::{generate_proposals, proposal_recall, Proposal};
use gtsdb_rpn::rpn_nn::training::{load_network, load_split, predict};
use image::DynamicImage;
use log::info;
use structopt::StructOpt;
use tch::Device;

#[derive(Debug, Clone, StructOpt)]
/// Draws the proposals of a trained RPN and measures their recall
struct Args {
    #[structopt(long, default_value = "rpn.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(long)]
    /// defaults to the best checkpoint of the configured checkpoint dir
    pub weights: Option<PathBuf>,
    #[structopt(long, default_value = "proposals")]
    pub output_dir: PathBuf,
    #[structopt(long, default_value = "20")]
    /// proposals drawn per image
    pub draw_top_n: usize,
    #[structopt(long, default_value = "0.5")]
    pub recall_iou: f64,
    /// images to run on, the validation split when empty
    pub images: Vec<PathBuf>,
}

struct Predictor {
    config: Config,
    network: RpnNetwork,
    targets: AnchorTargetBuilder,
    device: Device,
}

impl Predictor {
    /// Resized image, its resized boxes and the proposals found in it
    fn run(
        &self,
        img_path: &Path,
        bboxes: &[SignBbox],
    ) -> Result<(DynamicImage, Vec<SignBbox>, Vec<Proposal>)> {
        let dataset = &self.config.dataset;
        let img = image::open(img_path)
            .with_context(|| format!("error opening img {}", img_path.display()))?;
        let (img, bboxes) =
            resize_with_bboxes(img, bboxes, dataset.image_width, dataset.image_height);
        let image = from_img_to_normalized_tensor(&img);
        let (logits, deltas) = predict(&self.network, &image, self.device)?;
        let proposals = generate_proposals(
            &logits,
            &deltas,
            self.targets.anchors(),
            self.targets.image_size(),
            &self.config.proposals,
        )?;
        Ok((img, bboxes, proposals))
    }
}

fn main() -> Result<()> {
    gtsdb_rpn::init_logging();
    let args = Args::from_args();
    let config = Config::open(&args.config_file)
        .with_context(|| format!("failed to load config file '{}'", args.config_file.display()))?;

    let weights = args
        .weights
        .clone()
        .unwrap_or_else(|| config.training.checkpoint_dir.join(BEST_CHECKPOINT_FILENAME));
    let (_vs, network) = load_network(&config, &weights)
        .with_context(|| format!("failed to load weights '{}'", weights.display()))?;
    info!("loaded {}", weights.display());

    let samples: Vec<(PathBuf, Vec<SignBbox>)> = if args.images.is_empty() {
        let (_train, val) = load_split(&config)?;
        val.into_iter()
            .map(|ImgFilenameWithBboxes { img_filename, bboxes }| {
                (config.dataset.dir.join(img_filename), bboxes)
            })
            .collect()
    } else {
        args.images.iter().map(|path| (path.clone(), vec![])).collect()
    };

    let predictor = Predictor {
        targets: AnchorTargetBuilder::from_config(&config),
        device: config.training.device.device(),
        network,
        config,
    };

    fs::create_dir_all(&args.output_dir)?;
    let mut all_proposals = BTreeMap::new();
    let (mut found, mut total) = (0, 0);
    for (img_path, bboxes) in &samples {
        let (mut img, bboxes, proposals) = predictor.run(img_path, bboxes)?;
        let (img_found, img_total) = proposal_recall(&proposals, &bboxes, args.recall_iou);
        found += img_found;
        total += img_total;

        let top = &proposals[..proposals.len().min(args.draw_top_n)];
        draw_proposals_to_img(&mut img, top, PROPOSAL_COLOR);
        draw_bbs_to_img(&mut img, &bboxes, GT_COLOR);

        let img_filename = img_path
            .file_name()
            .map(|name| PathBuf::from(name).with_extension("jpg"))
            .with_context(|| format!("no file name in {}", img_path.display()))?;
        img.to_rgb8().save(args.output_dir.join(&img_filename))?;
        info!(
            "{}: {} proposals, best score {:.3}, {}/{} signs found",
            img_filename.display(),
            proposals.len(),
            proposals.first().map_or(0., |p| p.score),
            img_found,
            img_total
        );
        all_proposals.insert(img_filename.to_string_lossy().into_owned(), proposals);
    }

    let proposals_path = args.output_dir.join("proposals.json");
    serde_json::to_writer_pretty(File::create(&proposals_path)?, &all_proposals)?;
    if total > 0 {
        info!(
            "recall at IoU {}: {}/{} ({:.1}%)",
            args.recall_iou,
            found,
            total,
            100. * found as f64 / total as f64
        );
    }
    info!("wrote {}", proposals_path.display());
    Ok(())
}
