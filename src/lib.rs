pub mod config;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod presets;
pub mod report;
pub mod server;
pub mod stages;
pub mod task;
pub mod validation;
pub mod watch;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use orchestrator::{Orchestrator, OrchestratorContext};
pub use pipeline::{Artifact, StageRegistry};
pub use task::{BuildRun, TaskResult, TaskStatus};
