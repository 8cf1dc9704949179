use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;
use storyflow_contracts::GenerationConfig;

/// Shared cooperative cancellation flag.
///
/// The interpreter checks it before every instruction and hands it to the
/// in-flight generation call; stopping promptly is up to the capability.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Completion in `[0, 1]`.
    pub fraction: f64,
    pub phase: String,
}

impl Progress {
    pub fn new(fraction: f64, phase: impl Into<String>) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            fraction,
            phase: phase.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    TextToImage,
    ImageToImage,
    Inpainting,
}

impl GenerationMode {
    /// A mask wins over a plain source image.
    pub fn select(has_source: bool, has_mask: bool) -> Self {
        if has_mask {
            Self::Inpainting
        } else if has_source {
            Self::ImageToImage
        } else {
            Self::TextToImage
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TextToImage => "text-to-image",
            Self::ImageToImage => "image-to-image",
            Self::Inpainting => "inpainting",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub source_image: Option<&'a DynamicImage>,
    pub mask: Option<&'a DynamicImage>,
    pub config: &'a GenerationConfig,
    pub frame_count: u32,
    pub cancel: &'a CancelToken,
}

impl GenerationRequest<'_> {
    pub fn mode(&self) -> GenerationMode {
        GenerationMode::select(self.source_image.is_some(), self.mask.is_some())
    }
}

/// External image-generation service.
pub trait GenerationCapability: Send + Sync {
    fn name(&self) -> &str;

    fn check_connection(&self) -> bool;

    fn generate_image(
        &self,
        request: &GenerationRequest<'_>,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Vec<DynamicImage>>;
}
