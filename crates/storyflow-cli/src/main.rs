use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use storyflow_contracts::events::EventWriter;
use storyflow_contracts::runs::{write_report, ExecutionReport, InstructionOutcome};
use storyflow_contracts::{analyze, Instruction, Workflow, WorkflowAnalysis};
use storyflow_engine::{
    generator_for, EventLogObserver, ExecutionObserver, GenerationCapability, HttpGenerator,
    OutputImage, Progress, RunHandle, RunOutput, WorkflowInterpreter,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(name = "storyflow", version, about = "Run image-generation workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a workflow file.
    Run(RunArgs),
    /// Report what each instruction will do without running anything.
    Analyze(AnalyzeArgs),
    /// Check that the HTTP generation backend answers.
    Check(CheckArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    workflow: PathBuf,
    /// Working directory for relative paths. Defaults to the workflow's folder.
    #[arg(long)]
    dir: Option<PathBuf>,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    report: Option<PathBuf>,
    /// Cancel the run once it has taken this many seconds.
    #[arg(long)]
    max_seconds: Option<u64>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    workflow: PathBuf,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    #[arg(long)]
    api_base: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("storyflow error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_workflow(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Check(args) => run_check(args),
    }
}

fn run_workflow(args: RunArgs) -> Result<i32> {
    let workflow = Workflow::load(&args.workflow)?;
    let dir = working_directory(&args.workflow, args.dir.as_deref());
    if !dir.is_dir() {
        bail!("working directory {} does not exist", dir.display());
    }
    for warning in analyze(&workflow.instructions).warnings {
        eprintln!("warning: {warning}");
    }

    let generator = generator_for(&args.provider, args.api_base.as_deref())?;
    let run_id = uuid::Uuid::new_v4().to_string();
    let events_path = args.events.unwrap_or_else(|| dir.join("events.jsonl"));
    let observer = ConsoleObserver::new(EventLogObserver::new(EventWriter::new(
        &events_path,
        &run_id,
    )));

    println!(
        "Running {} instruction(s) with '{}' in {}",
        workflow.len(),
        generator.name(),
        dir.display()
    );
    let handle = WorkflowInterpreter::new(generator, &dir)
        .with_observer(observer)
        .spawn(workflow.instructions)?;
    let (report, images) = wait_for_run(handle, args.max_seconds.map(Duration::from_secs))?;

    println!("{}", summary_line(&report, images.len()));
    if let Some(path) = &args.report {
        write_report(path, &run_id, &report)
            .with_context(|| format!("failed writing report {}", path.display()))?;
        println!("Report written to {}", path.display());
    }
    Ok(if report.overall_success { 0 } else { 2 })
}

/// Joins the run, cancelling it first if it outlives `budget`.
fn wait_for_run(handle: RunHandle, budget: Option<Duration>) -> Result<RunOutput> {
    if let Some(budget) = budget {
        let deadline = Instant::now() + budget;
        loop {
            if Instant::now() >= deadline {
                eprintln!("warning: run exceeded {}s, cancelling", budget.as_secs());
                handle.cancel();
                break;
            }
            if handle.is_finished() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    handle.join()
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let workflow = Workflow::load(&args.workflow)?;
    let analysis = analyze(&workflow.instructions);
    for line in analysis_lines(&analysis) {
        println!("{line}");
    }
    Ok(0)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let generator = match args.api_base.as_deref() {
        Some(base) => HttpGenerator::new(base),
        None => HttpGenerator::from_env(),
    };
    let reachable = generator.check_connection();
    println!("{}", check_line(generator.api_base(), reachable));
    Ok(if reachable { 0 } else { 2 })
}

fn check_line(api_base: &str, reachable: bool) -> String {
    if reachable {
        format!("Generation backend at {api_base} is reachable")
    } else {
        format!("Generation backend at {api_base} is not reachable")
    }
}

fn working_directory(workflow: &Path, dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = dir {
        return dir.to_path_buf();
    }
    workflow
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Prints run progress and forwards every notification to the event log.
struct ConsoleObserver {
    events: EventLogObserver,
}

impl ConsoleObserver {
    fn new(events: EventLogObserver) -> Self {
        Self { events }
    }
}

impl ExecutionObserver for ConsoleObserver {
    fn on_run_start(&mut self, total: usize) {
        self.events.on_run_start(total);
    }

    fn on_instruction_start(&mut self, instruction: &Instruction, index: usize, total: usize) {
        println!("[{}/{total}] {}", index + 1, instruction.title());
        self.events.on_instruction_start(instruction, index, total);
    }

    fn on_instruction_complete(&mut self, instruction: &Instruction, outcome: &InstructionOutcome) {
        println!("      {}", outcome_line(outcome));
        self.events.on_instruction_complete(instruction, outcome);
    }

    fn on_progress(&mut self, progress: &Progress) {
        self.events.on_progress(progress);
    }

    fn on_finish(&mut self, report: &ExecutionReport, images: &[OutputImage]) {
        self.events.on_finish(report, images);
        if let Some(err) = self.events.write_error() {
            eprintln!(
                "warning: event log {} incomplete: {err}",
                self.events.events().path().display()
            );
        }
    }
}

fn outcome_line(outcome: &InstructionOutcome) -> String {
    if !outcome.success {
        return format!("failed: {}", outcome.message);
    }
    if outcome.skipped {
        return format!(
            "skipped: {}",
            outcome.skip_reason.as_deref().unwrap_or("not supported")
        );
    }
    if outcome.images_produced > 0 {
        return format!("ok ({} image(s)): {}", outcome.images_produced, outcome.message);
    }
    format!("ok: {}", outcome.message)
}

fn summary_line(report: &ExecutionReport, images: usize) -> String {
    let status = match &report.error_message {
        None => "completed".to_string(),
        Some(message) if report.was_cancelled() => format!("cancelled ({message})"),
        Some(message) => format!("failed: {message}"),
    };
    format!(
        "Run {status}; {} ok, {} skipped, {} failed, {images} image(s) in {} ms",
        report.succeeded_count(),
        report.skipped_count(),
        report.failed_count(),
        report.elapsed_millis
    )
}

fn analysis_lines(analysis: &WorkflowAnalysis) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in &analysis.entries {
        let mut line = format!("#{:<3} {:<8} {}", entry.index, entry.level.label(), entry.title);
        if let Some(reason) = entry.level.reason() {
            line.push_str(&format!(" ({reason})"));
        }
        lines.push(line);
    }
    lines.push(format!(
        "{} instruction(s): {} full, {} partial, {} unsupported",
        analysis.entries.len(),
        analysis.full_count(),
        analysis.partial_count(),
        analysis.unsupported_count()
    ));
    if !analysis.kind_counts.is_empty() {
        let counts: Vec<String> = analysis
            .kind_counts
            .iter()
            .map(|(name, count)| format!("{name}={count}"))
            .collect();
        lines.push(format!("kinds: {}", counts.join(" ")));
    }
    for warning in &analysis.warnings {
        lines.push(format!("warning: {warning}"));
    }
    lines
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use clap::Parser;
    use storyflow_contracts::runs::{InstructionOutcome, ReportBuilder};
    use storyflow_contracts::{analyze, Instruction, InstructionKind, Workflow};

    use super::{
        analysis_lines, check_line, outcome_line, run_workflow, summary_line, working_directory,
        Cli, Command, RunArgs,
    };

    #[test]
    fn run_command_parses_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "storyflow",
            "run",
            "--workflow",
            "flows/intro.json",
            "--provider",
            "http",
            "--api-base",
            "http://gpu:7860",
        ])?;
        let Command::Run(args) = cli.command else {
            anyhow::bail!("expected run command");
        };
        assert_eq!(args.workflow, PathBuf::from("flows/intro.json"));
        assert_eq!(args.provider, "http");
        assert_eq!(args.api_base.as_deref(), Some("http://gpu:7860"));
        assert!(args.dir.is_none() && args.report.is_none());
        assert!(args.max_seconds.is_none());

        let cli = Cli::try_parse_from([
            "storyflow",
            "run",
            "--workflow",
            "intro.json",
            "--max-seconds",
            "90",
        ])?;
        let Command::Run(args) = cli.command else {
            anyhow::bail!("expected run command");
        };
        assert_eq!(args.max_seconds, Some(90));
        assert_eq!(args.provider, "dryrun");
        Ok(())
    }

    #[test]
    fn check_line_names_the_backend_address() {
        assert_eq!(
            check_line("http://gpu:7860", true),
            "Generation backend at http://gpu:7860 is reachable"
        );
        assert_eq!(
            check_line("http://127.0.0.1:7860", false),
            "Generation backend at http://127.0.0.1:7860 is not reachable"
        );
    }

    #[test]
    fn working_directory_defaults_to_workflow_folder() {
        assert_eq!(
            working_directory(Path::new("flows/intro.json"), None),
            PathBuf::from("flows")
        );
        assert_eq!(working_directory(Path::new("intro.json"), None), PathBuf::from("."));
        assert_eq!(
            working_directory(Path::new("flows/intro.json"), Some(Path::new("/work"))),
            PathBuf::from("/work")
        );
    }

    #[test]
    fn outcome_lines_distinguish_status() {
        let instruction = Instruction::with_id("s", InstructionKind::Crop {});
        assert_eq!(
            outcome_line(&InstructionOutcome::skipped(&instruction, "no crop")),
            "skipped: no crop"
        );
        assert_eq!(
            outcome_line(&InstructionOutcome::failed(&instruction, "boom")),
            "failed: boom"
        );
        assert_eq!(
            outcome_line(&InstructionOutcome::produced(&instruction, "made", 2)),
            "ok (2 image(s)): made"
        );
    }

    #[test]
    fn summary_reports_failure_message() {
        let instruction = Instruction::with_id("s", InstructionKind::Crop {});
        let mut builder = ReportBuilder::new();
        builder.push(InstructionOutcome::failed(&instruction, "File not found: a.png"));
        builder.fail("File not found: a.png");
        let line = summary_line(&builder.finish(), 0);
        assert!(line.starts_with("Run failed: File not found: a.png;"), "{line}");
        assert!(line.contains("1 failed"));
    }

    #[test]
    fn analysis_lists_reasons_and_warnings() {
        let workflow = Workflow::new(vec![
            InstructionKind::Prompt("x".to_string()),
            InstructionKind::Crop {},
            InstructionKind::LoopEnd {},
        ]);
        let lines = analysis_lines(&analyze(&workflow.instructions));
        assert!(lines[1].contains("unsupported"));
        assert!(lines.iter().any(|line| line.starts_with("3 instruction(s): 1 full")));
        assert!(lines.iter().any(|line| line == "kinds: prompt=1 crop=1 loopEnd=1"));
        assert!(lines.iter().any(|line| line.starts_with("warning: ")));
    }

    #[test]
    fn dryrun_workflow_writes_images_events_and_report() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workflow = Workflow::new(vec![
            InstructionKind::Prompt("a quiet harbour".to_string()),
            InstructionKind::Config(storyflow_contracts::PartialGenerationConfig {
                width: Some(8),
                height: Some(8),
                steps: Some(2),
                ..Default::default()
            }),
            InstructionKind::Loop { count: 2, start: 0 },
            InstructionKind::LoopSave("shots/frame_".to_string()),
            InstructionKind::LoopEnd {},
        ]);
        let workflow_path = temp.path().join("flow.json");
        std::fs::write(&workflow_path, workflow.to_json()?)?;
        let report_path = temp.path().join("report.json");

        let code = run_workflow(RunArgs {
            workflow: workflow_path,
            dir: None,
            provider: "dryrun".to_string(),
            api_base: None,
            events: None,
            report: Some(report_path.clone()),
            max_seconds: Some(600),
        })?;

        assert_eq!(code, 0);
        assert!(temp.path().join("shots/frame_0.png").is_file());
        assert!(temp.path().join("shots/frame_1.png").is_file());
        let events = std::fs::read_to_string(temp.path().join("events.jsonl"))?;
        assert!(events.lines().any(|line| line.contains("\"run_finished\"")));
        let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(report_path)?)?;
        assert_eq!(report["overall_success"], serde_json::Value::Bool(true));
        Ok(())
    }

    #[test]
    fn failing_workflow_exits_with_two() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workflow = Workflow::new(vec![InstructionKind::CanvasSave("out.png".to_string())]);
        let workflow_path = temp.path().join("flow.json");
        std::fs::write(&workflow_path, workflow.to_json()?)?;

        let code = run_workflow(RunArgs {
            workflow: workflow_path,
            dir: Some(temp.path().to_path_buf()),
            provider: "dryrun".to_string(),
            api_base: None,
            events: Some(temp.path().join("logs/events.jsonl")),
            report: None,
            max_seconds: None,
        })?;

        assert_eq!(code, 2);
        assert!(temp.path().join("logs/events.jsonl").is_file());
        Ok(())
    }

    #[test]
    fn run_past_its_time_budget_is_cancelled() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let workflow = Workflow::new(vec![
            InstructionKind::Prompt("a long night".to_string()),
            InstructionKind::Config(storyflow_contracts::PartialGenerationConfig {
                width: Some(64),
                height: Some(64),
                steps: Some(50),
                ..Default::default()
            }),
            InstructionKind::Loop {
                count: 100_000,
                start: 0,
            },
            InstructionKind::Generate {},
            InstructionKind::LoopEnd {},
        ]);
        let workflow_path = temp.path().join("flow.json");
        std::fs::write(&workflow_path, workflow.to_json()?)?;
        let report_path = temp.path().join("report.json");

        let code = run_workflow(RunArgs {
            workflow: workflow_path,
            dir: None,
            provider: "dryrun".to_string(),
            api_base: None,
            events: None,
            report: Some(report_path.clone()),
            max_seconds: Some(0),
        })?;

        assert_eq!(code, 2);
        let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(report_path)?)?;
        assert_eq!(
            report["error_message"],
            serde_json::Value::String("Execution cancelled".to_string())
        );
        Ok(())
    }
}
