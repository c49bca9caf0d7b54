//! The workflow entity model and phase state machine.

pub mod plan_parser;
pub mod runner;
pub mod state;

pub use plan_parser::{parse_plan, ParsedPlanItem};
pub use runner::WorkflowRunner;
pub use state::{Phase, Status, TaskState, TaskStatus, WorkflowState};
