//! Workflow instruction model.
//!
//! On the wire every instruction is a single-key JSON object whose key names
//! the variant and whose value carries the payload, e.g.
//! `{"loop": {"loop": 3, "start": 0}}` or `{"canvasClear": {}}`.

mod workflow;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PartialGenerationConfig;

pub use workflow::Workflow;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstructionId(String);

impl InstructionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for InstructionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for InstructionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstructionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: InstructionId,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn new(kind: InstructionKind) -> Self {
        Self {
            id: InstructionId::new(),
            kind,
        }
    }

    pub fn with_id(id: impl Into<InstructionId>, kind: InstructionKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn title(&self) -> String {
        self.kind.title()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InpaintTools {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_blur: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_blur_outset: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_original: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstructionKind {
    Note(String),
    End {},
    Loop {
        #[serde(rename = "loop")]
        count: u32,
        #[serde(default)]
        start: u32,
    },
    LoopEnd {},

    Prompt(String),
    NegativePrompt(String),
    Config(PartialGenerationConfig),
    FrameCount(u32),

    CanvasClear {},
    CanvasLoad(String),
    CanvasSave(String),
    Generate {},
    MoveScale {
        x: f32,
        y: f32,
        scale: f32,
    },
    AdaptSize {
        #[serde(rename = "maxWidth")]
        max_width: u32,
        #[serde(rename = "maxHeight")]
        max_height: u32,
    },
    Crop {},

    RefAdd(String),
    RefClear {},
    RefFromCanvas {},
    RefRemove(u32),
    RefWeights(BTreeMap<u32, f32>),

    MaskLoad(String),
    MaskClear {},
    MaskGet {},
    MaskBackground {},
    MaskForeground {},
    MaskBody {},
    MaskAsk(String),

    DepthExtract {},
    DepthCanvas {},
    DepthToCanvas {},
    PoseExtract {},

    RemoveBackground {},
    FaceZoom {},
    AskZoom(String),
    XlMagic {},

    InpaintTools(InpaintTools),

    LoopLoad(String),
    LoopSave(String),
}

impl InstructionKind {
    /// Variant key used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Note(_) => "note",
            Self::End {} => "end",
            Self::Loop { .. } => "loop",
            Self::LoopEnd {} => "loopEnd",
            Self::Prompt(_) => "prompt",
            Self::NegativePrompt(_) => "negativePrompt",
            Self::Config(_) => "config",
            Self::FrameCount(_) => "frameCount",
            Self::CanvasClear {} => "canvasClear",
            Self::CanvasLoad(_) => "canvasLoad",
            Self::CanvasSave(_) => "canvasSave",
            Self::Generate {} => "generate",
            Self::MoveScale { .. } => "moveScale",
            Self::AdaptSize { .. } => "adaptSize",
            Self::Crop {} => "crop",
            Self::RefAdd(_) => "refAdd",
            Self::RefClear {} => "refClear",
            Self::RefFromCanvas {} => "refFromCanvas",
            Self::RefRemove(_) => "refRemove",
            Self::RefWeights(_) => "refWeights",
            Self::MaskLoad(_) => "maskLoad",
            Self::MaskClear {} => "maskClear",
            Self::MaskGet {} => "maskGet",
            Self::MaskBackground {} => "maskBackground",
            Self::MaskForeground {} => "maskForeground",
            Self::MaskBody {} => "maskBody",
            Self::MaskAsk(_) => "maskAsk",
            Self::DepthExtract {} => "depthExtract",
            Self::DepthCanvas {} => "depthCanvas",
            Self::DepthToCanvas {} => "depthToCanvas",
            Self::PoseExtract {} => "poseExtract",
            Self::RemoveBackground {} => "removeBackground",
            Self::FaceZoom {} => "faceZoom",
            Self::AskZoom(_) => "askZoom",
            Self::XlMagic {} => "xlMagic",
            Self::InpaintTools(_) => "inpaintTools",
            Self::LoopLoad(_) => "loopLoad",
            Self::LoopSave(_) => "loopSave",
        }
    }

    /// Short human-readable label for reports and progress output.
    pub fn title(&self) -> String {
        match self {
            Self::Note(text) => format!("Note: {}", clip(text, 40)),
            Self::End {} => "End".to_string(),
            Self::Loop { count, start } => format!("Loop {count}x from {start}"),
            Self::LoopEnd {} => "Loop End".to_string(),
            Self::Prompt(text) => format!("Prompt: {}", clip(text, 40)),
            Self::NegativePrompt(text) => format!("Negative Prompt: {}", clip(text, 40)),
            Self::Config(_) => "Config".to_string(),
            Self::FrameCount(frames) => format!("Frames: {frames}"),
            Self::CanvasClear {} => "Clear Canvas".to_string(),
            Self::CanvasLoad(path) => format!("Load Canvas: {path}"),
            Self::CanvasSave(path) => format!("Save Canvas: {path}"),
            Self::Generate {} => "Generate".to_string(),
            Self::MoveScale { x, y, scale } => format!("Move & Scale ({x}, {y}) x{scale}"),
            Self::AdaptSize {
                max_width,
                max_height,
            } => format!("Adapt Size {max_width}x{max_height}"),
            Self::Crop {} => "Crop".to_string(),
            Self::RefAdd(path) => format!("Add Reference: {path}"),
            Self::RefClear {} => "Clear References".to_string(),
            Self::RefFromCanvas {} => "Reference From Canvas".to_string(),
            Self::RefRemove(index) => format!("Remove Reference #{index}"),
            Self::RefWeights(weights) => format!("Reference Weights ({})", weights.len()),
            Self::MaskLoad(path) => format!("Load Mask: {path}"),
            Self::MaskClear {} => "Clear Mask".to_string(),
            Self::MaskGet {} => "Mask From Canvas".to_string(),
            Self::MaskBackground {} => "Mask Background".to_string(),
            Self::MaskForeground {} => "Mask Foreground".to_string(),
            Self::MaskBody {} => "Mask Body".to_string(),
            Self::MaskAsk(text) => format!("Ask Mask: {}", clip(text, 40)),
            Self::DepthExtract {} => "Extract Depth".to_string(),
            Self::DepthCanvas {} => "Depth From Canvas".to_string(),
            Self::DepthToCanvas {} => "Depth To Canvas".to_string(),
            Self::PoseExtract {} => "Extract Pose".to_string(),
            Self::RemoveBackground {} => "Remove Background".to_string(),
            Self::FaceZoom {} => "Face Zoom".to_string(),
            Self::AskZoom(text) => format!("Ask Zoom: {}", clip(text, 40)),
            Self::XlMagic {} => "XL Magic".to_string(),
            Self::InpaintTools(_) => "Inpaint Tools".to_string(),
            Self::LoopLoad(folder) => format!("Loop Load: {folder}"),
            Self::LoopSave(prefix) => format!("Loop Save: {prefix}"),
        }
    }

    pub fn requires_open_loop(&self) -> bool {
        matches!(self, Self::LoopLoad(_) | Self::LoopSave(_))
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().take(max_chars).collect::<String>() + "…"
}
