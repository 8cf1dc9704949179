use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use super::{clip, compact_error_body, env_setting, map_object};
use crate::capability::{GenerationCapability, GenerationMode, GenerationRequest, Progress};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:7860";

const API_BASE_ENV: &str = "STORYFLOW_API_BASE";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability backed by a local Stable Diffusion web API
/// (`/sdapi/v1/txt2img` and `/sdapi/v1/img2img`).
///
/// Calls are blocking; cancellation is honoured before the request is sent
/// and before the response is decoded.
pub struct HttpGenerator {
    api_base: String,
    http: HttpClient,
}

impl HttpGenerator {
    pub fn new(api_base: &str) -> Self {
        let trimmed = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if trimmed.is_empty() {
                DEFAULT_API_BASE.to_string()
            } else {
                trimmed.to_string()
            },
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(&env_setting(API_BASE_ENV).unwrap_or_else(|| DEFAULT_API_BASE.to_string()))
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn endpoint(&self, mode: GenerationMode) -> String {
        let route = match mode {
            GenerationMode::TextToImage => "txt2img",
            GenerationMode::ImageToImage | GenerationMode::Inpainting => "img2img",
        };
        format!("{}/sdapi/v1/{route}", self.api_base)
    }
}

impl GenerationCapability for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    fn check_connection(&self) -> bool {
        self.http
            .get(format!("{}/sdapi/v1/sd-models", self.api_base))
            .timeout(CONNECTION_TIMEOUT)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    fn generate_image(
        &self,
        request: &GenerationRequest<'_>,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Vec<DynamicImage>> {
        let mode = request.mode();
        let endpoint = self.endpoint(mode);
        let payload = build_payload(request)?;
        if request.cancel.is_cancelled() {
            bail!("generation cancelled before submit");
        }

        on_progress(Progress::new(0.0, "Submitting"));
        let response = self
            .http
            .post(&endpoint)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .with_context(|| format!("{} request failed ({endpoint})", mode.label()))?;
        let body = response_json_or_error(mode.label(), response)?;
        if request.cancel.is_cancelled() {
            bail!("generation cancelled");
        }

        on_progress(Progress::new(0.9, "Decoding"));
        let images = decode_images(&body)?;
        on_progress(Progress::new(1.0, "Done"));
        Ok(images)
    }
}

/// JSON body for the web API. LoRAs are appended to the prompt as
/// `<lora:name:weight>` tags.
fn build_payload(request: &GenerationRequest<'_>) -> Result<Value> {
    let config = request.config;
    let mut prompt = request.prompt.trim().to_string();
    for lora in &config.loras {
        let name = lora
            .file
            .trim()
            .trim_end_matches(".safetensors")
            .trim_end_matches(".ckpt");
        if name.is_empty() {
            continue;
        }
        prompt.push_str(&format!(" <lora:{name}:{}>", lora.weight));
    }

    let mut payload = map_object(json!({
        "prompt": prompt,
        "negative_prompt": config.negative_prompt,
        "width": config.width,
        "height": config.height,
        "steps": config.steps,
        "cfg_scale": config.guidance_scale,
        "seed": config.seed,
        "sampler_name": config.sampler,
        "batch_size": config.batch_size.max(1),
        "n_iter": config.batch_count.max(1),
    }));
    if !config.model.trim().is_empty() {
        payload.insert(
            "override_settings".to_string(),
            json!({ "sd_model_checkpoint": config.model.trim() }),
        );
    }

    if let Some(source) = request.source_image {
        payload.insert(
            "init_images".to_string(),
            json!([encode_png_base64(source).context("init image encode failed")?]),
        );
        payload.insert("denoising_strength".to_string(), json!(config.strength));
    }
    if let (GenerationMode::Inpainting, Some(mask)) = (request.mode(), request.mask) {
        payload.insert(
            "mask".to_string(),
            Value::String(encode_png_base64(mask).context("mask encode failed")?),
        );
        payload.insert("inpainting_fill".to_string(), json!(1));
        payload.insert("inpaint_full_res".to_string(), Value::Bool(false));
    }
    Ok(Value::Object(payload))
}

fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(BASE64.encode(bytes))
}

fn decode_images(body: &Value) -> Result<Vec<DynamicImage>> {
    let Some(items) = body.get("images").and_then(Value::as_array) else {
        bail!("response has no images list");
    };
    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let Some(data) = item.as_str().map(str::trim).filter(|data| !data.is_empty()) else {
            continue;
        };
        let data = match data.split_once(";base64,") {
            Some((_, encoded)) => encoded,
            None => data,
        };
        let bytes = BASE64
            .decode(data.as_bytes())
            .with_context(|| format!("image #{idx} base64 decode failed"))?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("image #{idx} could not be decoded"))?;
        out.push(image);
    }
    Ok(out)
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", clip(&compact_error_body(&body), 512));
    }
    serde_json::from_str(&body).with_context(|| format!("{label} returned invalid JSON payload"))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
    use serde_json::json;
    use storyflow_contracts::{GenerationConfig, LoraEntry};

    use super::{build_payload, decode_images, HttpGenerator, DEFAULT_API_BASE};
    use crate::capability::{CancelToken, GenerationMode, GenerationRequest};

    fn png_base64(width: u32, height: u32) -> anyhow::Result<String> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([9, 9, 9])))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(BASE64.encode(bytes))
    }

    #[test]
    fn api_base_is_normalized() {
        assert_eq!(HttpGenerator::new("http://gpu:7860/ ").api_base(), "http://gpu:7860");
        assert_eq!(HttpGenerator::new("  ").api_base(), DEFAULT_API_BASE);
        let generator = HttpGenerator::new("http://gpu:7860");
        assert_eq!(
            generator.endpoint(GenerationMode::TextToImage),
            "http://gpu:7860/sdapi/v1/txt2img"
        );
        assert_eq!(
            generator.endpoint(GenerationMode::Inpainting),
            "http://gpu:7860/sdapi/v1/img2img"
        );
    }

    #[test]
    fn text_to_image_payload_maps_config() -> anyhow::Result<()> {
        let cancel = CancelToken::new();
        let config = GenerationConfig {
            width: 512,
            steps: 12,
            model: "sdxl_base.safetensors".to_string(),
            negative_prompt: "blurry".to_string(),
            loras: vec![LoraEntry {
                file: "ink_style.safetensors".to_string(),
                weight: 0.6,
            }],
            ..GenerationConfig::default()
        };
        let request = GenerationRequest {
            prompt: "a cat",
            source_image: None,
            mask: None,
            config: &config,
            frame_count: 1,
            cancel: &cancel,
        };

        let payload = build_payload(&request)?;
        assert_eq!(payload["prompt"], json!("a cat <lora:ink_style:0.6>"));
        assert_eq!(payload["negative_prompt"], json!("blurry"));
        assert_eq!(payload["width"], json!(512));
        assert_eq!(payload["steps"], json!(12));
        assert_eq!(payload["sampler_name"], json!("DPM++ 2M Karras"));
        assert_eq!(
            payload["override_settings"]["sd_model_checkpoint"],
            json!("sdxl_base.safetensors")
        );
        assert!(payload.get("init_images").is_none());
        assert!(payload.get("mask").is_none());
        Ok(())
    }

    #[test]
    fn inpainting_payload_carries_source_and_mask() -> anyhow::Result<()> {
        let cancel = CancelToken::new();
        let config = GenerationConfig {
            strength: 0.35,
            ..GenerationConfig::default()
        };
        let source = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let mask = DynamicImage::new_luma8(4, 4);
        let request = GenerationRequest {
            prompt: "x",
            source_image: Some(&source),
            mask: Some(&mask),
            config: &config,
            frame_count: 1,
            cancel: &cancel,
        };

        let payload = build_payload(&request)?;
        assert_eq!(payload["init_images"].as_array().map(Vec::len), Some(1));
        assert!(payload["mask"].as_str().is_some_and(|mask| !mask.is_empty()));
        assert_eq!(payload["denoising_strength"].as_f64().map(|v| (v * 100.0).round()), Some(35.0));
        assert!(payload.get("override_settings").is_none());
        Ok(())
    }

    #[test]
    fn decode_accepts_plain_and_data_url_images() -> anyhow::Result<()> {
        let plain = png_base64(3, 2)?;
        let body = json!({
            "images": [plain.clone(), format!("data:image/png;base64,{plain}"), ""],
            "info": "{}",
        });
        let images = decode_images(&body)?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].dimensions(), (3, 2));
        Ok(())
    }

    #[test]
    fn decode_rejects_missing_list_and_bad_data() {
        assert!(decode_images(&json!({ "detail": "Not Found" })).is_err());
        assert!(decode_images(&json!({ "images": ["!!!"] })).is_err());
        assert!(decode_images(&json!({ "images": [] }))
            .map(|images| images.is_empty())
            .unwrap_or(false));
    }
}
