//! Run orchestration: the external tool executor, the wave scheduler that
//! drives it under a concurrency gate, and the reporter that turns results
//! into progress output and persisted reports.

mod executor;
mod reporter;
mod scheduler;

pub use executor::{
    parse_json_response, TaskExecutor, ToolOutcome, ToolResponse, ToolSettings,
    DEFAULT_ALLOWED_TOOLS,
};
pub use reporter::{ProgressEvent, Reporter, RunReport, TaskError, WaveSummary};
pub use scheduler::{RunOutcome, RunSettings, SchedulerState, WaveScheduler};
