//! Workflow execution for storyflow: the interpreter loop, per-run state,
//! working-directory file access and the generation capabilities it drives.

pub mod capability;
pub mod error;
pub mod files;
pub mod interpreter;
pub mod observer;
pub mod output;
pub mod providers;
pub mod state;

pub use capability::{
    CancelToken, GenerationCapability, GenerationMode, GenerationRequest, Progress,
};
pub use error::ExecutionError;
pub use files::WorkingDirectory;
pub use interpreter::{RunHandle, RunOutput, WorkflowInterpreter};
pub use observer::{EventLogObserver, ExecutionObserver, NoopObserver};
pub use output::OutputImage;
pub use providers::{generator_for, DryrunGenerator, HttpGenerator, GENERATOR_NAMES};
pub use state::{ExecutionState, LoopFrame};
