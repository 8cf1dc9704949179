pub mod report;

pub use report::{
    write_report, ExecutionReport, InstructionOutcome, ReportBuilder, CANCELLED_MESSAGE,
};
