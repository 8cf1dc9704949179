//! Built-in generation capabilities.

mod dryrun;
mod http;

use std::env;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::{Map, Value};

use crate::capability::GenerationCapability;

pub use dryrun::DryrunGenerator;
pub use http::{HttpGenerator, DEFAULT_API_BASE};

pub const GENERATOR_NAMES: &[&str] = &["dryrun", "http"];

/// Builds a capability by name. `api_base` only applies to `http`.
pub fn generator_for(name: &str, api_base: Option<&str>) -> Result<Arc<dyn GenerationCapability>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "dryrun" => Ok(Arc::new(DryrunGenerator::new())),
        "http" => Ok(Arc::new(match api_base {
            Some(base) => HttpGenerator::new(base),
            None => HttpGenerator::from_env(),
        })),
        other => bail!(
            "unknown generator '{other}' (expected one of: {})",
            GENERATOR_NAMES.join(", ")
        ),
    }
}

/// Shortest run of base64 alphabet characters treated as an encoded image.
const BASE64_RUN_MIN: usize = 200;

/// Renders a cause chain on one line, compacting every part and dropping
/// consecutive duplicates.
pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let part = compact_error_body(&cause.to_string());
        if part.is_empty() || parts.last() == Some(&part) {
            continue;
        }
        parts.push(part);
    }
    clip(&parts.join(" | caused by: "), max_chars)
}

/// Collapses whitespace and elides long base64 runs. The web API echoes
/// `init_images` and `mask` back in its validation errors.
pub(crate) fn compact_error_body(text: &str) -> String {
    let mut out = String::new();
    let mut run = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=') {
            run.push(ch);
            continue;
        }
        flush_run(&mut out, &mut run);
        out.push(ch);
    }
    flush_run(&mut out, &mut run);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn flush_run(out: &mut String, run: &mut String) {
    if run.len() >= BASE64_RUN_MIN {
        out.push_str(&format!("<base64 {} chars>", run.len()));
    } else {
        out.push_str(run);
    }
    run.clear();
}

pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn env_setting(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
