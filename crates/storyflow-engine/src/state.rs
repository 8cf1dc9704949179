use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use storyflow_contracts::GenerationConfig;

use crate::capability::GenerationMode;

/// Runtime record of an open loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFrame {
    pub count: u32,
    pub start: u32,
    /// Widened so `start + count` never saturates near `u32::MAX`.
    pub current_index: u64,
    /// Index of the `loop` instruction that opened this frame.
    pub return_instruction_index: usize,
}

impl LoopFrame {
    pub fn new(count: u32, start: u32, return_instruction_index: usize) -> Self {
        Self {
            count,
            start,
            current_index: u64::from(start),
            return_instruction_index,
        }
    }

    /// Zero-based iteration number.
    pub fn iteration(&self) -> u32 {
        let passed = self.current_index.saturating_sub(u64::from(self.start));
        u32::try_from(passed).unwrap_or(u32::MAX)
    }

    pub fn end_index(&self) -> u64 {
        u64::from(self.start) + u64::from(self.count)
    }
}

/// Mutable pipeline context for one run. Rebuilt at the start of every run.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub canvas: Option<DynamicImage>,
    pub mask: Option<DynamicImage>,
    pub prompt: String,
    pub negative_prompt: String,
    pub config: GenerationConfig,
    pub frame_count: u32,
    pub references: Vec<DynamicImage>,
    pub reference_weights: BTreeMap<u32, f32>,
    pub loop_stack: Vec<LoopFrame>,
    pub working_directory: PathBuf,
}

impl ExecutionState {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            canvas: None,
            mask: None,
            prompt: String::new(),
            negative_prompt: String::new(),
            config: GenerationConfig::default(),
            frame_count: 1,
            references: Vec::new(),
            reference_weights: BTreeMap::new(),
            loop_stack: Vec::new(),
            working_directory: working_directory.into(),
        }
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn set_negative_prompt(&mut self, text: &str) {
        self.negative_prompt = text.to_string();
        self.config.negative_prompt = text.to_string();
    }

    pub fn generation_mode(&self) -> GenerationMode {
        GenerationMode::select(self.canvas.is_some(), self.mask.is_some())
    }

    pub fn active_loop(&self) -> Option<&LoopFrame> {
        self.loop_stack.last()
    }
}
