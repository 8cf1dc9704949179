use anyhow::{bail, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::capability::{GenerationCapability, GenerationMode, GenerationRequest, Progress};

/// Offline capability that paints deterministic placeholder images.
///
/// Text-to-image yields a solid colour derived from the prompt and seed.
/// With a canvas the colour is blended over the resized source by
/// `strength`; with a mask only the light mask pixels are repainted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunGenerator;

impl DryrunGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl GenerationCapability for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn check_connection(&self) -> bool {
        true
    }

    fn generate_image(
        &self,
        request: &GenerationRequest<'_>,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Vec<DynamicImage>> {
        let config = request.config;
        if config.width == 0 || config.height == 0 {
            bail!("invalid size {}x{}", config.width, config.height);
        }
        let images = config.images_per_call().max(1);
        let steps = config.steps.max(1);
        let total = f64::from(images) * f64::from(steps);
        let source = request
            .source_image
            .map(|image| image.resize_exact(config.width, config.height, FilterType::Triangle).to_rgb8());
        let mask = request
            .mask
            .map(|image| image.resize_exact(config.width, config.height, FilterType::Nearest).to_luma8());

        let mut out = Vec::new();
        for idx in 0..images {
            for step in 0..steps {
                if request.cancel.is_cancelled() {
                    bail!("dryrun generation cancelled");
                }
                let done = f64::from(idx) * f64::from(steps) + f64::from(step + 1);
                on_progress(Progress::new(
                    done / total,
                    format!("Sampling {}/{steps}", step + 1),
                ));
            }

            let color = color_from_prompt(request.prompt, config.seed, idx);
            let image = match (request.mode(), source.as_ref()) {
                (GenerationMode::TextToImage, _) | (_, None) => {
                    RgbImage::from_pixel(config.width, config.height, Rgb(color))
                }
                (mode, Some(source)) => {
                    let strength = config.strength.clamp(0.0, 1.0);
                    let mut image = source.clone();
                    for (x, y, pixel) in image.enumerate_pixels_mut() {
                        let repaint = match (mode, mask.as_ref()) {
                            (GenerationMode::Inpainting, Some(mask)) => mask.get_pixel(x, y)[0] > 127,
                            _ => true,
                        };
                        if repaint {
                            *pixel = blend(*pixel, color, strength);
                        }
                    }
                    image
                }
            };
            out.push(DynamicImage::ImageRgb8(image));
        }
        Ok(out)
    }
}

fn color_from_prompt(prompt: &str, seed: i64, idx: u32) -> [u8; 3] {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2]]
}

fn blend(base: Rgb<u8>, color: [u8; 3], strength: f32) -> Rgb<u8> {
    let mix = |a: u8, b: u8| -> u8 {
        (f32::from(a) * (1.0 - strength) + f32::from(b) * strength)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgb([
        mix(base[0], color[0]),
        mix(base[1], color[1]),
        mix(base[2], color[2]),
    ])
}
