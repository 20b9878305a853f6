pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gate;
pub mod logging;
pub mod pressure;
pub mod run;
pub mod scheduler;
pub mod util;
pub mod workflow;

pub use config::EngineConfig;
pub use errors::{EngineError, ErrorTag, StepError};
pub use run::{ApprovalDecision, Run, RunManager, RunState, RunStatus};
pub use workflow::WorkflowDef;
