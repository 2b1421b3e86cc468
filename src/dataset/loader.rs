//! Fundus Dataset Loader
//!
//! Discovers classes and image files under a dataset root:
//!
//! ```text
//! root/
//! ├── Diabetic_Retinopathy/
//! │   ├── img_0001.jpg
//! │   └── ...
//! ├── Glaucoma/
//! ├── Healthy/
//! └── Myopia/
//! ```
//!
//! Class folders are sorted by name and numbered in that order, so the
//! mapping only depends on the folder names.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use colored::Colorize;
use image::ImageReader;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::utils::error::{EyeConditionError, ImageResultExt, Result};

/// Extensions accepted as images (compared lowercase)
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Ordered class names; the position of a name is its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Name → index pairs
    pub fn to_map(&self) -> BTreeMap<String, usize> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect()
    }
}

impl fmt::Display for ClassIndex {
    /// `{"Glaucoma": 0, "Healthy": 1}`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, name) in self.names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}: {}", name, i)?;
        }
        write!(f, "}}")
    }
}

/// An image path with its class label
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub label: usize,
}

/// Every image found under the root, grouped by class
#[derive(Debug, Clone)]
pub struct FundusDirectory {
    pub root: PathBuf,
    pub classes: ClassIndex,
    /// `files_by_class[label]` holds that class's image paths, sorted
    pub files_by_class: Vec<Vec<PathBuf>>,
}

impl FundusDirectory {
    /// Scan `root` for class folders and their images.
    ///
    /// Fails when the root is missing, has no class folders, or a class
    /// folder holds no image. Every image header is read once so corrupt
    /// files are reported here rather than mid-epoch.
    pub fn scan<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Scanning dataset root: {:?}", root);

        if !root.is_dir() {
            return Err(EyeConditionError::DatasetNotFound(root));
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            // follows symlinks, so linked class folders count
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                class_names.push(name);
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            return Err(EyeConditionError::Dataset(format!(
                "no class folders under {}",
                root.display()
            )));
        }

        let mut files_by_class = Vec::with_capacity(class_names.len());
        for (label, class_name) in class_names.iter().enumerate() {
            let files = list_images(&root.join(class_name))?;
            if files.is_empty() {
                return Err(EyeConditionError::Dataset(format!(
                    "class folder '{}' contains no images",
                    class_name
                )));
            }
            for path in &files {
                check_readable(path)?;
            }
            debug!("Class '{}' (label {}): {} images", class_name, label, files.len());
            files_by_class.push(files);
        }

        let directory = Self {
            root,
            classes: ClassIndex::new(class_names),
            files_by_class,
        };
        info!(
            "Found {} images in {} classes",
            directory.total_images(),
            directory.classes.len()
        );
        Ok(directory)
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn total_images(&self) -> usize {
        self.files_by_class.iter().map(Vec::len).sum()
    }

    pub fn get_stats(&self) -> DatasetStats {
        DatasetStats {
            total_samples: self.total_images(),
            num_classes: self.num_classes(),
            class_counts: self
                .classes
                .names()
                .iter()
                .cloned()
                .zip(self.files_by_class.iter().map(Vec::len))
                .collect(),
        }
    }
}

/// All image files below a class folder, sorted by path
fn list_images(class_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(class_dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            EyeConditionError::Dataset(format!("failed to walk {}: {}", class_dir.display(), e))
        })?;
        if entry.path().is_file() && is_image_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn is_image_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    if hidden {
        return false;
    }
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Read just the header of an image to make sure it can be decoded
fn check_readable(path: &Path) -> Result<()> {
    ImageReader::open(path)
        .for_image(path)?
        .with_guessed_format()
        .for_image(path)?
        .into_dimensions()
        .for_image(path)?;
    Ok(())
}

/// Statistics about the dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub num_classes: usize,
    /// `(class name, image count)` in label order
    pub class_counts: Vec<(String, usize)>,
}

impl DatasetStats {
    pub fn print(&self) {
        println!("{}", "Dataset Statistics:".cyan().bold());
        println!("  Total images: {}", self.total_samples);
        println!("  Classes:      {}", self.num_classes);
        for (label, (name, count)) in self.class_counts.iter().enumerate() {
            println!("    [{:>2}] {:<28} {:>6}", label, name, count);
        }
    }
}
