//! Image-folder dataset loading.
//!
//! Expects one subdirectory per class under the dataset root; class labels
//! are assigned by sorted subdirectory name. Images are decoded, resized,
//! and converted to CHW float arrays normalized to [0, 1].

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::ImageReader;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

/// A single example ready for batching.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageItem {
    /// Image data as flattened CHW float array [channels * H * W]
    pub image: Vec<f32>,
    /// Class label
    pub label: usize,
    /// Source path (for debugging/logging)
    pub path: String,
}

impl ImageItem {
    /// Load and preprocess one image.
    pub fn from_path(path: &Path, label: usize, image_size: usize) -> Result<Self> {
        let img = ImageReader::open(path)
            .with_context(|| format!("failed to open image {:?}", path))?
            .decode()
            .with_context(|| format!("failed to decode image {:?}", path))?
            .resize_exact(image_size as u32, image_size as u32, FilterType::Triangle)
            .to_rgb8();

        let (width, height) = (image_size, image_size);
        let mut image = vec![0.0f32; 3 * height * width];

        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x as u32, y as u32);
                image[y * width + x] = pixel[0] as f32 / 255.0;
                image[height * width + y * width + x] = pixel[1] as f32 / 255.0;
                image[2 * height * width + y * width + x] = pixel[2] as f32 / 255.0;
            }
        }

        Ok(Self {
            image,
            label,
            path: path.to_string_lossy().to_string(),
        })
    }
}

/// An image-folder dataset scanned from disk.
#[derive(Debug, Clone)]
pub struct FolderDataset {
    /// (path, label) pairs in scan order
    pub samples: Vec<(PathBuf, usize)>,
    /// Class names by label index
    pub class_names: Vec<String>,
    /// Target square image size
    pub image_size: usize,
}

impl FolderDataset {
    /// Scan `root` for class subdirectories and their images.
    pub fn scan(root: &Path, image_size: usize) -> Result<Self> {
        if !root.is_dir() {
            bail!("dataset root {:?} is not a directory", root);
        }

        let mut class_names: Vec<String> = std::fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        class_names.sort();

        if class_names.is_empty() {
            bail!("no class subdirectories found under {:?}", root);
        }

        let mut samples = Vec::new();
        for (label, class) in class_names.iter().enumerate() {
            let class_dir = root.join(class);
            let mut count = 0usize;
            for entry in WalkDir::new(&class_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if is_image_file(entry.path()) {
                    samples.push((entry.path().to_path_buf(), label));
                    count += 1;
                }
            }
            debug!("class '{}' ({}): {} images", class, label, count);
        }

        if samples.is_empty() {
            bail!("no images found under {:?}", root);
        }

        info!(
            "scanned {} images across {} classes from {:?}",
            samples.len(),
            class_names.len(),
            root
        );

        Ok(Self {
            samples,
            class_names,
            image_size,
        })
    }

    /// Decode every sample into memory.
    pub fn load_items(&self) -> Result<Vec<ImageItem>> {
        let mut items = Vec::with_capacity(self.samples.len());
        for (path, label) in &self.samples {
            items.push(ImageItem::from_path(path, *label, self.image_size)?);
        }
        info!("loaded {} images into memory", items.len());
        Ok(items)
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

fn is_image_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "bmp")
    )
}
