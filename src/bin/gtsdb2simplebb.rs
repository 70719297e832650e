use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gtsdb_rpn::dataset::common_structs::ImgFilenameWithBboxes;
use gtsdb_rpn::dataset::data_transformers::gtsdb::{load_labels, SuperCategory};
use gtsdb_rpn::dataset::data_transformers::img2tensor::resize_with_bboxes;
use gtsdb_rpn::rpn_nn::helpers::img_drawing::{draw_bbs_to_img, GT_COLOR};
use itertools::Itertools;
use log::{error, info};
use rayon::prelude::*;
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
/// Resizes the GTSDB images and writes their boxes to a labels.json file
struct Args {
    #[structopt(long, default_value = "GTSDB")]
    /// directory with the ppm images and gt.txt
    pub input_dir: PathBuf,
    #[structopt(long, default_value = "GTSDB_resized")]
    pub output_dir: PathBuf,
    #[structopt(long, default_value = "680")]
    pub width: u32,
    #[structopt(long, default_value = "400")]
    pub height: u32,
    #[structopt(long, default_value = "gt.txt")]
    pub gt_file: String,
    #[structopt(long, default_value = "ppm")]
    pub image_extension: String,
    #[structopt(long)]
    /// also write a copy of every image with its boxes drawn
    pub draw: bool,
}

fn convert(args: &Args, label: &ImgFilenameWithBboxes) -> Result<ImgFilenameWithBboxes> {
    let img_path = args.input_dir.join(&label.img_filename);
    let img = image::open(&img_path)
        .with_context(|| format!("error opening img {}", img_path.display()))?;
    let (resized, bboxes) = resize_with_bboxes(img, &label.bboxes, args.width, args.height);

    let img_filename = Path::new(&label.img_filename)
        .with_extension("jpg")
        .to_string_lossy()
        .into_owned();
    resized
        .to_rgb8()
        .save(args.output_dir.join(&img_filename))
        .with_context(|| format!("error saving {}", img_filename))?;
    if args.draw {
        let mut drawn = resized;
        draw_bbs_to_img(&mut drawn, &bboxes, GT_COLOR);
        drawn
            .to_rgb8()
            .save(args.output_dir.join("drawn").join(&img_filename))?;
    }
    Ok(ImgFilenameWithBboxes {
        img_filename,
        bboxes,
    })
}

fn main() -> Result<()> {
    gtsdb_rpn::init_logging();
    let args = Args::from_args();

    let labels = load_labels(&args.input_dir, &args.gt_file, &args.image_extension)?;
    let nb_signs: usize = labels.iter().map(|label| label.bboxes.len()).sum();
    info!("{} images with {} signs", labels.len(), nb_signs);
    for (category, count) in labels
        .iter()
        .flat_map(|label| &label.bboxes)
        .map(|bb| SuperCategory::of_class(bb.class_id))
        .counts()
        .into_iter()
        .sorted()
    {
        info!("{:?}: {}", category, count);
    }

    fs::create_dir_all(&args.output_dir)?;
    if args.draw {
        fs::create_dir_all(args.output_dir.join("drawn"))?;
    }

    info!("Resizing imgs and bboxes to {}x{}", args.width, args.height);
    let converted: Vec<ImgFilenameWithBboxes> = labels
        .par_iter()
        .filter_map(|label| match convert(&args, label) {
            Ok(converted) => Some(converted),
            Err(e) => {
                error!("{:#}", e);
                None
            }
        })
        .collect();

    let labels_path = args.output_dir.join("labels.json");
    let file = File::create(&labels_path)?;
    serde_json::to_writer_pretty(file, &converted)?;
    info!(
        "wrote {} of {} images and {}",
        converted.len(),
        labels.len(),
        labels_path.display()
    );
    Ok(())
}
