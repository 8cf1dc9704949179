//! Static support classification for instruction kinds.
//!
//! The reason strings here are the only copy: the interpreter reports skips
//! with exactly the text returned by [`support_level`].

use indexmap::IndexMap;

use crate::instructions::{Instruction, InstructionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportLevel {
    Full,
    Partial(&'static str),
    Unsupported(&'static str),
}

impl SupportLevel {
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Full => None,
            Self::Partial(reason) | Self::Unsupported(reason) => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial(_) => "partial",
            Self::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

const REF_ADD: &str =
    "Reference image is tracked but not sent to the generation capability";
const INPAINT_TOOLS: &str =
    "Only strength is applied; mask blur, outset and restore-original need the host inpainting pipeline";

const CANVAS_CLEAR: &str = "Clearing the canvas needs the host application's canvas state";
const MOVE_SCALE: &str = "Moving and scaling needs the host application's canvas transform";
const ADAPT_SIZE: &str = "Adapting the canvas size needs the host application's canvas transform";
const CROP: &str = "Cropping needs the host application's canvas selection";

const REF_CLEAR: &str = "Clearing references needs the host application's moodboard state";
const REF_FROM_CANVAS: &str =
    "Adding the canvas as a reference needs the host application's moodboard state";
const REF_REMOVE: &str = "Removing a reference needs the host application's moodboard state";
const REF_WEIGHTS: &str = "Reference weights need the host application's moodboard state";

const MASK_CLEAR: &str = "Clearing the mask needs the host application's mask layer";
const MASK_GET: &str = "Deriving a mask from the canvas needs the host application's mask layer";
const MASK_BACKGROUND: &str = "Background masking needs the host application's segmentation model";
const MASK_FOREGROUND: &str = "Foreground masking needs the host application's segmentation model";
const MASK_BODY: &str = "Body masking needs the host application's segmentation model";
const MASK_ASK: &str = "Prompted masking needs the host application's segmentation model";

const DEPTH_EXTRACT: &str = "Depth extraction needs the host application's control-map state";
const DEPTH_CANVAS: &str = "Depth from canvas needs the host application's control-map state";
const DEPTH_TO_CANVAS: &str = "Depth to canvas needs the host application's control-map state";
const POSE_EXTRACT: &str = "Pose extraction needs the host application's control-map state";

const REMOVE_BACKGROUND: &str = "Background removal needs the host application's matting model";
const FACE_ZOOM: &str = "Face zoom needs the host application's face detector";
const ASK_ZOOM: &str = "Prompted zoom needs the host application's detection model";
const XL_MAGIC: &str = "XL Magic needs the host application's upscaling pipeline";

/// Classifies how completely `kind` can run without the host tool's internal state.
pub fn support_level(kind: &InstructionKind) -> SupportLevel {
    use SupportLevel::{Full, Partial, Unsupported};

    match kind {
        InstructionKind::Note(_)
        | InstructionKind::End {}
        | InstructionKind::Loop { .. }
        | InstructionKind::LoopEnd {}
        | InstructionKind::Prompt(_)
        | InstructionKind::NegativePrompt(_)
        | InstructionKind::Config(_)
        | InstructionKind::FrameCount(_)
        | InstructionKind::CanvasLoad(_)
        | InstructionKind::CanvasSave(_)
        | InstructionKind::Generate {}
        | InstructionKind::MaskLoad(_)
        | InstructionKind::LoopLoad(_)
        | InstructionKind::LoopSave(_) => Full,

        InstructionKind::RefAdd(_) => Partial(REF_ADD),
        InstructionKind::InpaintTools(_) => Partial(INPAINT_TOOLS),

        InstructionKind::CanvasClear {} => Unsupported(CANVAS_CLEAR),
        InstructionKind::MoveScale { .. } => Unsupported(MOVE_SCALE),
        InstructionKind::AdaptSize { .. } => Unsupported(ADAPT_SIZE),
        InstructionKind::Crop {} => Unsupported(CROP),
        InstructionKind::RefClear {} => Unsupported(REF_CLEAR),
        InstructionKind::RefFromCanvas {} => Unsupported(REF_FROM_CANVAS),
        InstructionKind::RefRemove(_) => Unsupported(REF_REMOVE),
        InstructionKind::RefWeights(_) => Unsupported(REF_WEIGHTS),
        InstructionKind::MaskClear {} => Unsupported(MASK_CLEAR),
        InstructionKind::MaskGet {} => Unsupported(MASK_GET),
        InstructionKind::MaskBackground {} => Unsupported(MASK_BACKGROUND),
        InstructionKind::MaskForeground {} => Unsupported(MASK_FOREGROUND),
        InstructionKind::MaskBody {} => Unsupported(MASK_BODY),
        InstructionKind::MaskAsk(_) => Unsupported(MASK_ASK),
        InstructionKind::DepthExtract {} => Unsupported(DEPTH_EXTRACT),
        InstructionKind::DepthCanvas {} => Unsupported(DEPTH_CANVAS),
        InstructionKind::DepthToCanvas {} => Unsupported(DEPTH_TO_CANVAS),
        InstructionKind::PoseExtract {} => Unsupported(POSE_EXTRACT),
        InstructionKind::RemoveBackground {} => Unsupported(REMOVE_BACKGROUND),
        InstructionKind::FaceZoom {} => Unsupported(FACE_ZOOM),
        InstructionKind::AskZoom(_) => Unsupported(ASK_ZOOM),
        InstructionKind::XlMagic {} => Unsupported(XL_MAGIC),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionSupport {
    pub index: usize,
    pub name: &'static str,
    pub title: String,
    pub level: SupportLevel,
}

/// Pre-flight view of a workflow: what will run, what will be skipped, and
/// structural problems visible without executing anything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowAnalysis {
    pub entries: Vec<InstructionSupport>,
    /// Instruction counts keyed by wire name, in first-seen order.
    pub kind_counts: IndexMap<&'static str, usize>,
    pub warnings: Vec<String>,
}

impl WorkflowAnalysis {
    pub fn full_count(&self) -> usize {
        self.count_where(|level| matches!(level, SupportLevel::Full))
    }

    pub fn partial_count(&self) -> usize {
        self.count_where(|level| matches!(level, SupportLevel::Partial(_)))
    }

    pub fn unsupported_count(&self) -> usize {
        self.count_where(SupportLevel::is_unsupported)
    }

    pub fn is_fully_supported(&self) -> bool {
        self.full_count() == self.entries.len()
    }

    fn count_where(&self, predicate: impl Fn(&SupportLevel) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.level))
            .count()
    }
}

pub fn analyze(instructions: &[Instruction]) -> WorkflowAnalysis {
    let mut analysis = WorkflowAnalysis::default();
    let mut depth = 0usize;
    let mut end_seen_at: Option<usize> = None;

    for (index, instruction) in instructions.iter().enumerate() {
        let kind = &instruction.kind;
        analysis.entries.push(InstructionSupport {
            index,
            name: kind.name(),
            title: kind.title(),
            level: support_level(kind),
        });
        *analysis.kind_counts.entry(kind.name()).or_insert(0) += 1;

        if let Some(end_index) = end_seen_at {
            if end_index + 1 == index {
                analysis.warnings.push(format!(
                    "instructions from #{index} on follow `end` at #{end_index} and never run"
                ));
            }
            continue;
        }

        match kind {
            InstructionKind::Loop { .. } => depth += 1,
            InstructionKind::LoopEnd {} => {
                if depth == 0 {
                    analysis.warnings.push(format!(
                        "instruction #{index}: loop end without matching loop start"
                    ));
                } else {
                    depth -= 1;
                }
            }
            InstructionKind::End {} => end_seen_at = Some(index),
            _ if kind.requires_open_loop() && depth == 0 => {
                analysis.warnings.push(format!(
                    "instruction #{index}: {} must be inside a loop",
                    kind.name()
                ));
            }
            _ => {}
        }
    }

    if depth > 0 && end_seen_at.is_none() {
        analysis
            .warnings
            .push(format!("{depth} loop(s) never closed with loopEnd"));
    }
    analysis
}
