pub mod fail_wrapper;
pub mod inprocess;
pub mod script;

use std::fmt;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;

use crate::{Task, Worker};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Failed to write launch script")]
    ScriptWrite,
    #[error("Failed to spawn task process")]
    Spawn,
    #[error("Task process was lost")]
    Lost,
}

/// How a task process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTermination {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl TaskTermination {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for TaskTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown termination"),
        }
    }
}

/// Starts a task on a worker. The session is generic over this, so scheduler
/// behavior can be tested without real processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    type Launched: LaunchedTask + Send;

    /// Start the task bound to the worker's host and core range. Failures
    /// here are absorbed by the session: logged, counted against the task,
    /// and the worker is freed.
    async fn launch(
        &self,
        task: &Task,
        worker: &Worker,
    ) -> Result<Self::Launched, Report<LaunchError>>;
}

/// A task that has been started and not yet reaped.
#[async_trait]
pub trait LaunchedTask: Send {
    /// OS process id, when the launcher created a real process.
    fn pid(&self) -> Option<u32>;

    /// Resolves when the task ends.
    async fn wait(&mut self) -> Result<TaskTermination, Report<LaunchError>>;

    /// Forcefully end the task.
    async fn kill(&mut self) -> Result<(), Report<LaunchError>>;

    /// Remove any on-disk launch artifacts.
    async fn cleanup(&mut self) -> Result<(), Report<LaunchError>> {
        Ok(())
    }
}
