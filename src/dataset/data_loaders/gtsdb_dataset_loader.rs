use std::path::{Path, PathBuf};

use anyhow::Context;
use image::DynamicImage;

use crate::dataset::common_structs::{ImgFilenameWithBboxes, SignBbox};
use crate::dataset::data_transformers::img2tensor::resize_with_bboxes;
use crate::dataset::DataLoader;

/// Loads GTSDB images one by one, resized to the network input size
pub struct GtsdbDataLoader {
    data_dir: PathBuf,
    imgs_and_labels_data: std::vec::IntoIter<ImgFilenameWithBboxes>,
    target_width: u32,
    target_height: u32,
    max_elem_index: usize,
    next_element_index: usize,
}

impl GtsdbDataLoader {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        labels: Vec<ImgFilenameWithBboxes>,
        target_width: u32,
        target_height: u32,
    ) -> GtsdbDataLoader {
        GtsdbDataLoader {
            data_dir: data_dir.as_ref().to_owned(),
            max_elem_index: labels.len(),
            imgs_and_labels_data: labels.into_iter(),
            target_width,
            target_height,
            next_element_index: 0,
        }
    }

    fn load(&self, label: ImgFilenameWithBboxes) -> anyhow::Result<(DynamicImage, Vec<SignBbox>)> {
        let path = self.data_dir.join(&label.img_filename);
        let img = image::open(&path)
            .with_context(|| format!("error loading image '{}'", path.display()))?;
        Ok(resize_with_bboxes(
            img,
            &label.bboxes,
            self.target_width,
            self.target_height,
        ))
    }
}

impl Iterator for GtsdbDataLoader {
    type Item = anyhow::Result<(DynamicImage, Vec<SignBbox>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let next_data = self.imgs_and_labels_data.next()?;
        self.next_element_index += 1;
        Some(self.load(next_data))
    }
}

impl DataLoader for GtsdbDataLoader {
    fn next_element_index(&self) -> usize {
        self.next_element_index
    }

    fn max_elem_index(&self) -> usize {
        self.max_elem_index
    }
}
