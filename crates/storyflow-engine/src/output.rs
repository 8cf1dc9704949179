use std::path::PathBuf;

use image::{DynamicImage, GenericImageView};
use sha2::{Digest, Sha256};
use storyflow_contracts::{GenerationConfig, InstructionId};

/// An image produced by a generation call, tagged with the settings that
/// were in effect when it was generated.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub instruction_id: InstructionId,
    pub image: DynamicImage,
    pub prompt: String,
    pub negative_prompt: String,
    pub config: GenerationConfig,
    /// Set when the image was also written to the working directory.
    pub saved_path: Option<PathBuf>,
}

impl OutputImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Hex sha256 over the dimensions and RGBA pixels.
    pub fn fingerprint(&self) -> String {
        let (width, height) = self.dimensions();
        let mut hasher = Sha256::new();
        hasher.update(width.to_be_bytes());
        hasher.update(height.to_be_bytes());
        hasher.update(self.image.to_rgba8().as_raw());
        hex::encode(hasher.finalize())
    }
}
