use serde_json::{json, Map, Value};
use storyflow_contracts::events::EventWriter;
use storyflow_contracts::runs::{ExecutionReport, InstructionOutcome};
use storyflow_contracts::Instruction;

use crate::capability::Progress;
use crate::output::OutputImage;

/// Caller-facing run notifications. Every method defaults to a no-op.
pub trait ExecutionObserver: Send {
    fn on_run_start(&mut self, _total: usize) {}

    fn on_instruction_start(&mut self, _instruction: &Instruction, _index: usize, _total: usize) {}

    fn on_instruction_complete(&mut self, _instruction: &Instruction, _outcome: &InstructionOutcome) {
    }

    fn on_progress(&mut self, _progress: &Progress) {}

    fn on_finish(&mut self, _report: &ExecutionReport, _images: &[OutputImage]) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Mirrors run notifications into `events.jsonl`.
///
/// A failed write never aborts the run; the first failure is kept and can be
/// inspected with [`EventLogObserver::write_error`].
#[derive(Debug, Clone)]
pub struct EventLogObserver {
    events: EventWriter,
    write_error: Option<String>,
}

impl EventLogObserver {
    pub fn new(events: EventWriter) -> Self {
        Self {
            events,
            write_error: None,
        }
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn write_error(&self) -> Option<&str> {
        self.write_error.as_deref()
    }

    fn emit(&mut self, event_type: &str, payload: Value) {
        if let Err(err) = self.events.emit(event_type, map_object(payload)) {
            if self.write_error.is_none() {
                self.write_error = Some(format!("{event_type}: {err:#}"));
            }
        }
    }
}

impl ExecutionObserver for EventLogObserver {
    fn on_run_start(&mut self, total: usize) {
        self.emit("run_started", json!({ "total": total }));
    }

    fn on_instruction_start(&mut self, instruction: &Instruction, index: usize, total: usize) {
        self.emit(
            "instruction_started",
            json!({
                "instruction_id": instruction.id,
                "kind": instruction.kind.name(),
                "title": instruction.title(),
                "index": index,
                "total": total,
            }),
        );
    }

    fn on_instruction_complete(&mut self, instruction: &Instruction, outcome: &InstructionOutcome) {
        self.emit(
            "instruction_completed",
            json!({
                "instruction_id": instruction.id,
                "kind": instruction.kind.name(),
                "success": outcome.success,
                "skipped": outcome.skipped,
                "skip_reason": outcome.skip_reason,
                "message": outcome.message,
                "images_produced": outcome.images_produced,
            }),
        );
    }

    fn on_progress(&mut self, progress: &Progress) {
        self.emit(
            "generation_progress",
            json!({
                "fraction": progress.fraction,
                "phase": progress.phase,
            }),
        );
    }

    fn on_finish(&mut self, report: &ExecutionReport, images: &[OutputImage]) {
        for image in images {
            let (width, height) = image.dimensions();
            self.emit(
                "output_image",
                json!({
                    "instruction_id": image.instruction_id,
                    "width": width,
                    "height": height,
                    "fingerprint": image.fingerprint(),
                    "saved_path": image
                        .saved_path
                        .as_ref()
                        .map(|path| path.to_string_lossy().to_string()),
                    "prompt": image.prompt,
                    "seed": image.config.seed,
                }),
            );
        }
        self.emit(
            "run_finished",
            json!({
                "overall_success": report.overall_success,
                "total_images_produced": report.total_images_produced,
                "skipped": report.skipped_count(),
                "failed": report.failed_count(),
                "error_message": report.error_message,
                "elapsed_millis": report.elapsed_millis,
            }),
        );
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
