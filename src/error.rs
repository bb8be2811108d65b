use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a pipeline invocation outright.
///
/// Task transform failures are not represented here: they are captured per
/// task in [`crate::task::TaskStatus::Failed`] and never stop sibling tasks.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),
    #[error("unknown task '{name}'. Available tasks: {available}")]
    UnknownTask { name: String, available: String },
    #[error("task dependency cycle detected among: {0}")]
    DependencyCycle(String),
    #[error("failed to clean output directory {}", path.display())]
    Clean {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind dev server on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
