use std::path::Path;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::instructions::{Instruction, InstructionId};

pub const CANCELLED_MESSAGE: &str = "Execution cancelled";

/// Result of running a single instruction. A skip counts as success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionOutcome {
    pub instruction_id: InstructionId,
    pub title: String,
    pub success: bool,
    pub message: String,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub images_produced: u32,
}

impl InstructionOutcome {
    pub fn completed(instruction: &Instruction, message: impl Into<String>) -> Self {
        Self::produced(instruction, message, 0)
    }

    pub fn produced(instruction: &Instruction, message: impl Into<String>, images: u32) -> Self {
        Self {
            instruction_id: instruction.id.clone(),
            title: instruction.title(),
            success: true,
            message: message.into(),
            skipped: false,
            skip_reason: None,
            images_produced: images,
        }
    }

    pub fn skipped(instruction: &Instruction, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            instruction_id: instruction.id.clone(),
            title: instruction.title(),
            success: true,
            message: format!("Skipped: {reason}"),
            skipped: true,
            skip_reason: Some(reason),
            images_produced: 0,
        }
    }

    pub fn failed(instruction: &Instruction, message: impl Into<String>) -> Self {
        Self {
            instruction_id: instruction.id.clone(),
            title: instruction.title(),
            success: false,
            message: message.into(),
            skipped: false,
            skip_reason: None,
            images_produced: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub overall_success: bool,
    pub outcomes: Vec<InstructionOutcome>,
    pub total_images_produced: u32,
    pub error_message: Option<String>,
    pub elapsed_millis: u64,
}

impl ExecutionReport {
    pub fn skipped_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.skipped).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| !outcome.success).count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.success && !outcome.skipped)
            .count()
    }

    pub fn was_cancelled(&self) -> bool {
        self.error_message.as_deref() == Some(CANCELLED_MESSAGE)
    }
}

/// Accumulates outcomes while a run is in progress.
#[derive(Debug)]
pub struct ReportBuilder {
    started: Instant,
    outcomes: Vec<InstructionOutcome>,
    total_images: u32,
    error_message: Option<String>,
    cancelled: bool,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            outcomes: Vec::new(),
            total_images: 0,
            error_message: None,
            cancelled: false,
        }
    }

    pub fn push(&mut self, outcome: InstructionOutcome) {
        self.total_images = self.total_images.saturating_add(outcome.images_produced);
        self.outcomes.push(outcome);
    }

    /// Records the message that halted the run. Only the first one is kept.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn outcomes(&self) -> &[InstructionOutcome] {
        &self.outcomes
    }

    /// Cancellation takes precedence: a cancelled run reports
    /// [`CANCELLED_MESSAGE`] even when an instruction failed first. The
    /// failed outcome keeps its own message.
    pub fn finish(self) -> ExecutionReport {
        let error_message = if self.cancelled {
            Some(CANCELLED_MESSAGE.to_string())
        } else {
            self.error_message
        };
        ExecutionReport {
            overall_success: error_message.is_none(),
            outcomes: self.outcomes,
            total_images_produced: self.total_images,
            error_message,
            elapsed_millis: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Writes a pretty-printed report with derived counts and a finish timestamp.
pub fn write_report(path: &Path, run_id: &str, report: &ExecutionReport) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), Value::String(run_id.to_string()));
    payload.insert("finished_at".to_string(), Value::String(now_utc_iso()));
    payload.insert(
        "skipped".to_string(),
        Value::Number((report.skipped_count() as u64).into()),
    );
    payload.insert(
        "failed".to_string(),
        Value::Number((report.failed_count() as u64).into()),
    );
    if let Value::Object(fields) = serde_json::to_value(report)? {
        for (key, value) in fields {
            payload.insert(key, value);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{write_report, InstructionOutcome, ReportBuilder, CANCELLED_MESSAGE};
    use crate::instructions::{Instruction, InstructionKind};

    fn instruction(kind: InstructionKind) -> Instruction {
        Instruction::with_id("step", kind)
    }

    #[test]
    fn skip_is_a_success() {
        let outcome = InstructionOutcome::skipped(&instruction(InstructionKind::Crop {}), "nope");
        assert!(outcome.success);
        assert!(outcome.skipped);
        assert_eq!(outcome.skip_reason.as_deref(), Some("nope"));
    }

    #[test]
    fn builder_derives_counts_from_outcomes() {
        let mut builder = ReportBuilder::new();
        builder.push(InstructionOutcome::completed(
            &instruction(InstructionKind::Prompt("x".to_string())),
            "Prompt set",
        ));
        builder.push(InstructionOutcome::produced(
            &instruction(InstructionKind::Generate {}),
            "Generated 2 images",
            2,
        ));
        builder.push(InstructionOutcome::skipped(
            &instruction(InstructionKind::Crop {}),
            "unsupported",
        ));
        builder.push(InstructionOutcome::failed(
            &instruction(InstructionKind::CanvasLoad("a.png".to_string())),
            "missing",
        ));
        builder.fail("missing");
        builder.fail("second failure is ignored");

        let report = builder.finish();
        assert!(!report.overall_success);
        assert_eq!(report.total_images_produced, 2);
        assert_eq!(report.succeeded_count(), 2);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.error_message.as_deref(), Some("missing"));
        assert!(!report.was_cancelled());
    }

    #[test]
    fn cancellation_has_its_own_message() {
        let mut builder = ReportBuilder::new();
        builder.mark_cancelled();
        let report = builder.finish();
        assert!(!report.overall_success);
        assert_eq!(report.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(report.was_cancelled());
    }

    #[test]
    fn cancellation_outranks_recorded_failure() {
        let mut builder = ReportBuilder::new();
        builder.push(InstructionOutcome::failed(
            &instruction(InstructionKind::CanvasLoad("a.png".to_string())),
            "File not found: a.png",
        ));
        builder.fail("File not found: a.png");
        builder.mark_cancelled();

        let report = builder.finish();
        assert!(report.was_cancelled());
        assert_eq!(report.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(report.outcomes[0].message, "File not found: a.png");
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn empty_run_succeeds() {
        let report = ReportBuilder::new().finish();
        assert!(report.overall_success);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn write_report_includes_counts_and_outcomes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("report.json");
        let mut builder = ReportBuilder::new();
        builder.push(InstructionOutcome::skipped(
            &instruction(InstructionKind::XlMagic {}),
            "unsupported",
        ));
        write_report(&path, "run-7", &builder.finish())?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-7"));
        assert_eq!(parsed["skipped"], json!(1));
        assert_eq!(parsed["failed"], json!(0));
        assert_eq!(parsed["overall_success"], json!(true));
        assert_eq!(parsed["outcomes"][0]["instruction_id"], json!("step"));
        assert!(parsed.get("finished_at").and_then(Value::as_str).is_some());
        Ok(())
    }
}
