//! Instruction-pointer driven workflow execution.
//!
//! A run walks a flat instruction list. Loops are an explicit stack of
//! [`LoopFrame`]s: `loop` pushes a frame after it runs, `loopEnd` either jumps
//! back to the instruction after the matching `loop` or pops the frame. The
//! first failed instruction halts the run; skips never do.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use storyflow_contracts::runs::{ExecutionReport, InstructionOutcome, ReportBuilder};
use storyflow_contracts::{
    support_level, InpaintTools, Instruction, InstructionKind, PartialGenerationConfig,
};

use crate::capability::{CancelToken, GenerationCapability, GenerationRequest, Progress};
use crate::error::ExecutionError;
use crate::files::{load_image_at, WorkingDirectory};
use crate::observer::{ExecutionObserver, NoopObserver};
use crate::output::OutputImage;
use crate::providers::error_chain_text;
use crate::state::{ExecutionState, LoopFrame};

pub type RunOutput = (ExecutionReport, Vec<OutputImage>);

/// Executes workflows against one generation capability.
///
/// Only one run may be active per interpreter; `execute` takes `&mut self`
/// so the borrow checker enforces this for in-thread use.
pub struct WorkflowInterpreter {
    generator: Arc<dyn GenerationCapability>,
    working_directory: WorkingDirectory,
    cancel: CancelToken,
    observer: Box<dyn ExecutionObserver>,
}

impl WorkflowInterpreter {
    pub fn new(
        generator: Arc<dyn GenerationCapability>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            generator,
            working_directory: WorkingDirectory::new(working_directory),
            cancel: CancelToken::new(),
            observer: Box::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: impl ExecutionObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn working_directory(&self) -> &Path {
        self.working_directory.root()
    }

    pub fn set_working_directory(&mut self, working_directory: impl Into<PathBuf>) {
        self.working_directory = WorkingDirectory::new(working_directory);
    }

    pub fn generator(&self) -> &dyn GenerationCapability {
        self.generator.as_ref()
    }

    pub fn check_connection(&self) -> bool {
        self.generator.check_connection()
    }

    /// Token that cancels the current (or next started) run from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn execute(&mut self, instructions: &[Instruction]) -> RunOutput {
        self.cancel.reset();
        self.run(instructions)
    }

    /// Runs `instructions` on a dedicated thread.
    pub fn spawn(mut self, instructions: Vec<Instruction>) -> Result<RunHandle> {
        self.cancel.reset();
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name("storyflow-run".to_string())
            .spawn(move || self.run(&instructions))
            .context("failed to spawn workflow run thread")?;
        Ok(RunHandle { cancel, handle })
    }

    fn run(&mut self, instructions: &[Instruction]) -> RunOutput {
        let run = Run {
            generator: self.generator.as_ref(),
            files: &self.working_directory,
            cancel: &self.cancel,
            observer: self.observer.as_mut(),
            state: ExecutionState::new(self.working_directory.root()),
            report: ReportBuilder::new(),
            images: Vec::new(),
        };
        run.execute(instructions)
    }
}

/// A run executing on its own thread. Dropping the handle detaches the run.
pub struct RunHandle {
    cancel: CancelToken,
    handle: thread::JoinHandle<RunOutput>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<RunOutput> {
        self.handle
            .join()
            .map_err(|_| anyhow!("workflow run thread panicked"))
    }
}

enum Handled {
    Done(String),
    Skipped(String),
    Generated {
        message: String,
        images: Vec<DynamicImage>,
        saved_path: Option<PathBuf>,
    },
    /// Continue at `next` instead of the following instruction.
    Jump { message: String, next: usize },
}

struct Run<'a> {
    generator: &'a dyn GenerationCapability,
    files: &'a WorkingDirectory,
    cancel: &'a CancelToken,
    observer: &'a mut (dyn ExecutionObserver + 'static),
    state: ExecutionState,
    report: ReportBuilder,
    images: Vec<OutputImage>,
}

impl Run<'_> {
    fn execute(mut self, instructions: &[Instruction]) -> RunOutput {
        let total = instructions.len();
        self.observer.on_run_start(total);

        let mut ip = 0usize;
        while ip < total {
            if self.cancel.is_cancelled() {
                self.report.mark_cancelled();
                break;
            }
            let instruction = &instructions[ip];
            self.observer.on_instruction_start(instruction, ip, total);

            let (outcome, jump) = self.dispatch(instructions, ip);
            self.observer.on_instruction_complete(instruction, &outcome);
            let success = outcome.success;
            let message = outcome.message.clone();
            self.report.push(outcome);

            if !success {
                self.report.fail(message);
                break;
            }
            if let Some(next) = jump {
                ip = next;
                continue;
            }
            match &instruction.kind {
                InstructionKind::End {} => break,
                InstructionKind::Loop { count, start } => {
                    self.state
                        .loop_stack
                        .push(LoopFrame::new(*count, *start, ip));
                }
                _ => {}
            }
            ip += 1;
        }
        // A cancel raised while the last instruction ran still counts.
        if self.cancel.is_cancelled() {
            self.report.mark_cancelled();
        }

        let report = self.report.finish();
        self.observer.on_finish(&report, &self.images);
        (report, self.images)
    }

    fn dispatch(
        &mut self,
        instructions: &[Instruction],
        ip: usize,
    ) -> (InstructionOutcome, Option<usize>) {
        let instruction = &instructions[ip];
        match self.handle(instructions, ip) {
            Ok(Handled::Done(message)) => (InstructionOutcome::completed(instruction, message), None),
            Ok(Handled::Skipped(reason)) => (InstructionOutcome::skipped(instruction, reason), None),
            Ok(Handled::Jump { message, next }) => (
                InstructionOutcome::completed(instruction, message),
                Some(next),
            ),
            Ok(Handled::Generated {
                message,
                images,
                saved_path,
            }) => {
                let count = images.len() as u32;
                for (idx, image) in images.into_iter().enumerate() {
                    self.images.push(OutputImage {
                        instruction_id: instruction.id.clone(),
                        image,
                        prompt: self.state.prompt.clone(),
                        negative_prompt: self.state.negative_prompt.clone(),
                        config: self.state.config.clone(),
                        saved_path: if idx == 0 { saved_path.clone() } else { None },
                    });
                }
                (InstructionOutcome::produced(instruction, message, count), None)
            }
            Err(err) => (InstructionOutcome::failed(instruction, err.to_string()), None),
        }
    }

    fn handle(
        &mut self,
        instructions: &[Instruction],
        ip: usize,
    ) -> Result<Handled, ExecutionError> {
        let kind = &instructions[ip].kind;
        match kind {
            InstructionKind::Note(_) => Ok(Handled::Done("Note".to_string())),
            InstructionKind::End {} => Ok(Handled::Done("Workflow ended".to_string())),
            InstructionKind::Loop { count: 0, .. } => {
                let next = matching_loop_end(instructions, ip)
                    .map(|end| end + 1)
                    .unwrap_or(instructions.len());
                Ok(Handled::Jump {
                    message: "Loop skipped: count is 0".to_string(),
                    next,
                })
            }
            InstructionKind::Loop { count, start } => Ok(Handled::Done(format!(
                "Loop started: {count} iteration(s) from index {start}"
            ))),
            InstructionKind::LoopEnd {} => self.loop_end(ip),

            InstructionKind::Prompt(text) => {
                self.state.prompt = text.clone();
                Ok(Handled::Done(format!(
                    "Prompt set ({} chars)",
                    text.chars().count()
                )))
            }
            InstructionKind::NegativePrompt(text) => {
                self.state.set_negative_prompt(text);
                Ok(Handled::Done(format!(
                    "Negative prompt set ({} chars)",
                    text.chars().count()
                )))
            }
            InstructionKind::Config(partial) => Ok(Handled::Done(self.apply_config(partial))),
            InstructionKind::FrameCount(frames) => {
                self.state.frame_count = *frames;
                Ok(Handled::Done(format!("Frame count set to {frames}")))
            }

            InstructionKind::CanvasLoad(path) => {
                let image = self.files.load_image(path)?;
                let message = format!("Loaded canvas {path} ({})", describe_size(&image));
                self.state.canvas = Some(image);
                Ok(Handled::Done(message))
            }
            InstructionKind::CanvasSave(path) => self.canvas_save(path),
            InstructionKind::Generate {} => self.generate_only(),
            InstructionKind::MaskLoad(path) => {
                let image = self.files.load_image(path)?;
                let message = format!("Loaded mask {path} ({})", describe_size(&image));
                self.state.mask = Some(image);
                Ok(Handled::Done(message))
            }
            InstructionKind::RefAdd(path) => {
                let image = self.files.load_image(path)?;
                self.state.references.push(image);
                Ok(Handled::Skipped(skip_reason(kind)))
            }
            InstructionKind::InpaintTools(tools) => Ok(Handled::Done(self.apply_inpaint_tools(tools))),
            InstructionKind::LoopLoad(folder) => self.loop_load(folder),
            InstructionKind::LoopSave(prefix) => {
                let frame = self.open_loop("loopSave")?;
                let filename = format!("{prefix}{}.png", frame.iteration());
                self.canvas_save(&filename)
            }

            InstructionKind::CanvasClear {}
            | InstructionKind::MoveScale { .. }
            | InstructionKind::AdaptSize { .. }
            | InstructionKind::Crop {}
            | InstructionKind::RefClear {}
            | InstructionKind::RefFromCanvas {}
            | InstructionKind::RefRemove(_)
            | InstructionKind::RefWeights(_)
            | InstructionKind::MaskClear {}
            | InstructionKind::MaskGet {}
            | InstructionKind::MaskBackground {}
            | InstructionKind::MaskForeground {}
            | InstructionKind::MaskBody {}
            | InstructionKind::MaskAsk(_)
            | InstructionKind::DepthExtract {}
            | InstructionKind::DepthCanvas {}
            | InstructionKind::DepthToCanvas {}
            | InstructionKind::PoseExtract {}
            | InstructionKind::RemoveBackground {}
            | InstructionKind::FaceZoom {}
            | InstructionKind::AskZoom(_)
            | InstructionKind::XlMagic {} => Ok(Handled::Skipped(skip_reason(kind))),
        }
    }

    fn loop_end(&mut self, ip: usize) -> Result<Handled, ExecutionError> {
        let Some(frame) = self.state.loop_stack.last_mut() else {
            return Err(ExecutionError::loop_state(
                "loop end without matching loop start",
            ));
        };
        frame.current_index += 1;
        if frame.current_index < frame.end_index() {
            return Ok(Handled::Jump {
                message: format!(
                    "Loop iteration {} of {}",
                    frame.iteration() + 1,
                    frame.count
                ),
                next: frame.return_instruction_index + 1,
            });
        }
        let count = frame.count;
        self.state.loop_stack.pop();
        Ok(Handled::Jump {
            message: format!("Loop completed after {count} iteration(s)"),
            next: ip + 1,
        })
    }

    fn open_loop(&self, name: &str) -> Result<LoopFrame, ExecutionError> {
        self.state
            .active_loop()
            .copied()
            .ok_or_else(|| ExecutionError::loop_state(format!("{name} must be inside a loop")))
    }

    fn loop_load(&mut self, folder: &str) -> Result<Handled, ExecutionError> {
        let frame = self.open_loop("loopLoad")?;
        let files = self.files.list_images(folder)?;
        let index = frame.iteration() as usize;
        let Some(path) = files.get(index) else {
            return Err(ExecutionError::loop_state(format!(
                "loopLoad index {index} is out of range: {} image(s) in {folder}",
                files.len()
            )));
        };
        let image = load_image_at(path)?;
        let message = format!(
            "Loaded {} into canvas ({})",
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            describe_size(&image)
        );
        self.state.canvas = Some(image);
        Ok(Handled::Done(message))
    }

    fn apply_config(&mut self, partial: &PartialGenerationConfig) -> String {
        self.state.config.merge(partial);
        if let Some(negative_prompt) = &partial.negative_prompt {
            self.state.negative_prompt = negative_prompt.clone();
        }
        let fields: Vec<String> = serde_json::to_value(partial)
            .ok()
            .and_then(|value| value.as_object().map(|obj| obj.keys().cloned().collect()))
            .unwrap_or_default();
        if fields.is_empty() {
            "Config unchanged".to_string()
        } else {
            format!("Config updated: {}", fields.join(", "))
        }
    }

    fn apply_inpaint_tools(&mut self, tools: &InpaintTools) -> String {
        let ignored = tools.mask_blur.is_some()
            || tools.mask_blur_outset.is_some()
            || tools.restore_original.is_some();
        let mut message = match tools.strength {
            Some(strength) => {
                self.state.config.strength = strength;
                format!("Inpaint strength set to {strength}")
            }
            None => "No inpaint strength given".to_string(),
        };
        if ignored {
            message.push_str("; mask blur, outset and restore-original are not applied");
        }
        message
    }

    fn canvas_save(&mut self, path: &str) -> Result<Handled, ExecutionError> {
        if self.state.prompt.trim().is_empty() {
            let Some(canvas) = self.state.canvas.as_ref() else {
                return Err(ExecutionError::NoPrompt);
            };
            let written = self.files.save_image(path, canvas)?;
            return Ok(Handled::Done(format!(
                "Saved canvas to {}",
                written.display()
            )));
        }

        let mode = self.state.generation_mode();
        let images = self.run_generation()?;
        let written = self.files.save_image(path, &images[0])?;
        Ok(Handled::Generated {
            message: format!(
                "Generated {} image(s) ({}), saved {}",
                images.len(),
                mode.label(),
                path
            ),
            images,
            saved_path: Some(written),
        })
    }

    fn generate_only(&mut self) -> Result<Handled, ExecutionError> {
        if self.state.prompt.trim().is_empty() {
            if self.state.canvas.is_some() {
                return Ok(Handled::Done("No prompt set; canvas kept".to_string()));
            }
            return Err(ExecutionError::NoPrompt);
        }
        let mode = self.state.generation_mode();
        let images = self.run_generation()?;
        Ok(Handled::Generated {
            message: format!("Generated {} image(s) ({})", images.len(), mode.label()),
            images,
            saved_path: None,
        })
    }

    /// Calls the capability with the current state; the first image becomes the canvas.
    fn run_generation(&mut self) -> Result<Vec<DynamicImage>, ExecutionError> {
        let mode = self.state.generation_mode();
        let request = GenerationRequest {
            prompt: &self.state.prompt,
            source_image: self.state.canvas.as_ref(),
            mask: self.state.mask.as_ref(),
            config: &self.state.config,
            frame_count: self.state.frame_count,
            cancel: self.cancel,
        };
        let observer = &mut *self.observer;
        let mut forward = |progress: Progress| observer.on_progress(&progress);
        let result = self.generator.generate_image(&request, &mut forward);

        let images = match result {
            Err(_) if self.cancel.is_cancelled() => return Err(ExecutionError::Cancelled),
            Err(err) => {
                return Err(ExecutionError::provider(format!(
                    "{} generation failed: {}",
                    mode.label(),
                    error_chain_text(&err, 1024)
                )))
            }
            Ok(images) => images,
        };
        let Some(first) = images.first() else {
            return Err(ExecutionError::provider("No image generated"));
        };
        self.state.canvas = Some(first.clone());
        Ok(images)
    }
}

fn skip_reason(kind: &InstructionKind) -> String {
    support_level(kind)
        .reason()
        .unwrap_or("Not supported")
        .to_string()
}

fn matching_loop_end(instructions: &[Instruction], loop_index: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, instruction) in instructions.iter().enumerate().skip(loop_index + 1) {
        match instruction.kind {
            InstructionKind::Loop { .. } => depth += 1,
            InstructionKind::LoopEnd {} if depth == 0 => return Some(index),
            InstructionKind::LoopEnd {} => depth -= 1,
            _ => {}
        }
    }
    None
}

fn describe_size(image: &DynamicImage) -> String {
    let (width, height) = image.dimensions();
    format!("{width}x{height}")
}
