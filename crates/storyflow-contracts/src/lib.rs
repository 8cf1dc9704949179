//! Data contracts shared by the storyflow engine and CLI: the instruction
//! model, generation settings, support classification, run reports and the
//! JSONL event log.

pub mod config;
pub mod events;
pub mod instructions;
pub mod runs;
pub mod support;

pub use config::{GenerationConfig, LoraEntry, PartialGenerationConfig};
pub use instructions::{InpaintTools, Instruction, InstructionId, InstructionKind, Workflow};
pub use support::{analyze, support_level, SupportLevel, WorkflowAnalysis};
