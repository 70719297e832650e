use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;

use anyhow::{ensure, Context};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::dataset::common_structs::{ImgFilenameWithBboxes, SignBbox};

/// One line of the GTSDB `gt.txt`: `00000.ppm;774;411;815;446;11`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtRecord {
    pub filename: String,
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub class_id: u32,
}

impl GtRecord {
    pub fn bbox(&self) -> SignBbox {
        SignBbox {
            left: self.left,
            top: self.top,
            right: self.right,
            bottom: self.bottom,
            class_id: self.class_id,
        }
    }
}

/// The four sign groups GTSDB is evaluated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuperCategory {
    Prohibitory,
    Danger,
    Mandatory,
    Other,
}

impl SuperCategory {
    pub fn of_class(class_id: u32) -> SuperCategory {
        match class_id {
            0..=5 | 7..=10 | 15 | 16 => SuperCategory::Prohibitory,
            11 | 18..=31 => SuperCategory::Danger,
            33..=40 => SuperCategory::Mandatory,
            _ => SuperCategory::Other,
        }
    }
}

pub fn read_gt_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<GtRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open ground truth file '{}'", path.display()))?;

    let mut records = vec![];
    for (line, record) in reader.deserialize().enumerate() {
        let record: GtRecord = record
            .with_context(|| format!("invalid record at line {} of '{}'", line + 1, path.display()))?;
        records.push(record);
    }
    Ok(records)
}

/// Filenames (not paths) of every image with `extension` in `dir`, sorted
pub fn list_images<P: AsRef<Path>>(dir: P, extension: &str) -> anyhow::Result<Vec<String>> {
    let pattern = dir.as_ref().join(format!("*.{}", extension));
    let pattern = pattern
        .to_str()
        .with_context(|| format!("non UTF-8 dataset path '{}'", pattern.display()))?;
    let mut filenames = vec![];
    for entry in glob::glob(pattern)? {
        let path = entry?;
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            filenames.push(name.to_string());
        }
    }
    filenames.sort();
    Ok(filenames)
}

/// Groups the records by image. Every filename of `images` gets an entry, with no
/// boxes if it has no record. Records of images missing from `images` are dropped.
pub fn group_by_image(records: &[GtRecord], images: &[String]) -> Vec<ImgFilenameWithBboxes> {
    let mut grouped: BTreeMap<&str, Vec<SignBbox>> = images
        .iter()
        .map(|filename| (filename.as_str(), vec![]))
        .collect();
    for record in records {
        match grouped.get_mut(record.filename.as_str()) {
            Some(bboxes) => bboxes.push(record.bbox()),
            None => warn!("annotated image {} not found, skipping", record.filename),
        }
    }
    grouped
        .into_iter()
        .map(|(img_filename, bboxes)| ImgFilenameWithBboxes {
            img_filename: img_filename.to_string(),
            bboxes,
        })
        .collect()
}

/// Reads the labels of a dataset directory.
///
/// A `gt_file` ending in `.json` is a list of [ImgFilenameWithBboxes] (see the
/// `gtsdb2simplebb` binary), anything else is parsed as a GTSDB `gt.txt`.
pub fn load_labels<P: AsRef<Path>>(
    dir: P,
    gt_file: &str,
    image_extension: &str,
) -> anyhow::Result<Vec<ImgFilenameWithBboxes>> {
    let dir = dir.as_ref();
    let gt_path = dir.join(gt_file);
    let labels = if gt_file.ends_with(".json") {
        let file = File::open(&gt_path)
            .with_context(|| format!("failed to open labels file '{}'", gt_path.display()))?;
        serde_json::from_reader::<_, Vec<ImgFilenameWithBboxes>>(file)
            .with_context(|| format!("invalid labels file '{}'", gt_path.display()))?
    } else {
        let records = read_gt_file(&gt_path)?;
        let images = list_images(dir, image_extension)?;
        group_by_image(&records, &images)
    };
    ensure!(!labels.is_empty(), "no images found in '{}'", dir.display());
    debug!("loaded {} images from {}", labels.len(), dir.display());
    Ok(labels)
}

/// Keeps only the boxes whose class passes both filters. Degenerate boxes are
/// dropped too. Images left without boxes are kept as background samples.
pub fn filter_classes(
    labels: Vec<ImgFilenameWithBboxes>,
    class_whitelist: Option<&HashSet<u32>>,
    super_categories: Option<&[SuperCategory]>,
) -> Vec<ImgFilenameWithBboxes> {
    labels
        .into_iter()
        .map(|mut label| {
            label.bboxes.retain(|bb| {
                bb.area() > 0.
                    && class_whitelist.map_or(true, |set| set.contains(&bb.class_id))
                    && super_categories
                        .map_or(true, |cats| cats.contains(&SuperCategory::of_class(bb.class_id)))
            });
            label
        })
        .collect()
}

/// Deterministic (train, validation) split
pub fn train_val_split(
    mut labels: Vec<ImgFilenameWithBboxes>,
    val_fraction: f64,
    seed: u64,
) -> (Vec<ImgFilenameWithBboxes>, Vec<ImgFilenameWithBboxes>) {
    labels.shuffle(&mut StdRng::seed_from_u64(seed));
    let nb_val = (labels.len() as f64 * val_fraction).round() as usize;
    let train = labels.split_off(nb_val);
    (train, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gtsdb_rpn_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_and_groups_gt_file() {
        let dir = scratch_dir("gt");
        fs::write(
            dir.join("gt.txt"),
            "00000.ppm;774;411;815;446;11\n00000.ppm;983;388;1024;432;40\n00002.ppm;386;494;442;552;38\n00009.ppm;1;1;2;2;1\n",
        )
        .unwrap();
        for name in &["00000.ppm", "00001.ppm", "00002.ppm"] {
            fs::write(dir.join(name), b"").unwrap();
        }

        let records = read_gt_file(dir.join("gt.txt")).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0],
            GtRecord {
                filename: "00000.ppm".to_string(),
                left: 774.,
                top: 411.,
                right: 815.,
                bottom: 446.,
                class_id: 11,
            }
        );

        let labels = load_labels(&dir, "gt.txt", "ppm").unwrap();
        let names: Vec<&str> = labels.iter().map(|l| l.img_filename.as_str()).collect();
        assert_eq!(names, vec!["00000.ppm", "00001.ppm", "00002.ppm"]);
        assert_eq!(labels[0].bboxes.len(), 2);
        assert!(labels[1].bboxes.is_empty());
        assert_eq!(labels[2].bboxes[0].class_id, 38);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_gt_line_is_an_error() {
        let dir = scratch_dir("bad_gt");
        fs::write(dir.join("gt.txt"), "00000.ppm;774;oops;815;446;11\n").unwrap();
        assert!(read_gt_file(dir.join("gt.txt")).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn super_categories_of_known_classes() {
        assert_eq!(SuperCategory::of_class(14), SuperCategory::Other);
        assert_eq!(SuperCategory::of_class(2), SuperCategory::Prohibitory);
        assert_eq!(SuperCategory::of_class(25), SuperCategory::Danger);
        assert_eq!(SuperCategory::of_class(38), SuperCategory::Mandatory);
    }

    #[test]
    fn class_filters_keep_background_images() {
        let bb = |class_id| SignBbox {
            left: 0.,
            top: 0.,
            right: 10.,
            bottom: 10.,
            class_id,
        };
        let labels = vec![
            ImgFilenameWithBboxes {
                img_filename: "a.ppm".to_string(),
                bboxes: vec![bb(1), bb(38), bb(25)],
            },
            ImgFilenameWithBboxes {
                img_filename: "b.ppm".to_string(),
                bboxes: vec![bb(14)],
            },
        ];

        let filtered = filter_classes(labels.clone(), None, Some(&[SuperCategory::Mandatory][..]));
        assert_eq!(filtered[0].bboxes, vec![bb(38)]);
        assert!(filtered[1].bboxes.is_empty());

        let whitelist: HashSet<u32> = [1, 14].iter().copied().collect();
        let filtered = filter_classes(labels, Some(&whitelist), None);
        assert_eq!(filtered[0].bboxes, vec![bb(1)]);
        assert_eq!(filtered[1].bboxes, vec![bb(14)]);
    }

    #[test]
    fn split_is_deterministic_and_complete() {
        let labels: Vec<_> = (0..20)
            .map(|i| ImgFilenameWithBboxes {
                img_filename: format!("{:05}.ppm", i),
                bboxes: vec![],
            })
            .collect();
        let (train, val) = train_val_split(labels.clone(), 0.25, 3);
        assert_eq!(train.len(), 15);
        assert_eq!(val.len(), 5);
        let (train_again, val_again) = train_val_split(labels, 0.25, 3);
        assert_eq!(train, train_again);
        assert_eq!(val, val_again);
        assert!(val.iter().all(|v| !train.contains(v)));
    }
}
