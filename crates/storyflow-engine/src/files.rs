use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader};

use crate::error::ExecutionError;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff"];

/// Image file access rooted at a run's working directory.
///
/// Relative paths resolve against the root; absolute paths are used as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory {
    root: PathBuf,
}

impl WorkingDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn load_image(&self, relative: &str) -> Result<DynamicImage, ExecutionError> {
        load_image_at(&self.resolve(relative))
    }

    /// Encodes `image` by the target's extension, creating parent directories.
    pub fn save_image(
        &self,
        relative: &str,
        image: &DynamicImage,
    ) -> Result<PathBuf, ExecutionError> {
        let path = self.resolve(relative);
        let encode_failure = |message: String| ExecutionError::EncodeFailure {
            path: path.clone(),
            message,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| encode_failure(err.to_string()))?;
        }
        let result = if is_jpeg(&path) {
            DynamicImage::ImageRgb8(image.to_rgb8()).save(&path)
        } else {
            image.save(&path)
        };
        result.map_err(|err| encode_failure(err.to_string()))?;
        Ok(path)
    }

    /// Image files directly inside `folder`, sorted by file name.
    pub fn list_images(&self, folder: &str) -> Result<Vec<PathBuf>, ExecutionError> {
        let dir = self.resolve(folder);
        if !dir.is_dir() {
            return Err(ExecutionError::NotFound { path: dir });
        }
        let entries = std::fs::read_dir(&dir).map_err(|err| ExecutionError::DecodeFailure {
            path: dir.clone(),
            message: err.to_string(),
        })?;

        let mut images: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(images)
    }
}

pub fn load_image_at(path: &Path) -> Result<DynamicImage, ExecutionError> {
    if !path.is_file() {
        return Err(ExecutionError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let decode_failure = |message: String| ExecutionError::DecodeFailure {
        path: path.to_path_buf(),
        message,
    };
    ImageReader::open(path)
        .map_err(|err| decode_failure(err.to_string()))?
        .with_guessed_format()
        .map_err(|err| decode_failure(err.to_string()))?
        .decode()
        .map_err(|err| decode_failure(err.to_string()))
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
        .unwrap_or(false)
}
