//! Furrow is a task farm for batch jobs: it takes an ordered list of
//! shell-command tasks and a list of compute nodes, carves each node into
//! worker slots bound to contiguous core ranges, and runs one task per slot
//! until the list is drained.
//!
//! The [Session] drives everything from a single dispatch loop. Tasks are
//! started through a [Launcher]; the production [launch::script::ScriptLauncher]
//! writes an inspectable launch script per task and spawns it directly or
//! through an external parallel process launcher that pins the task to its
//! worker's cores.

pub mod launch;
pub mod session;
pub mod settings;
pub mod status;
pub mod stop;
pub mod task;
pub mod worker;

#[cfg(test)]
mod test_util;

pub use launch::script::ScriptLauncher;
pub use launch::{LaunchError, LaunchedTask, Launcher, TaskTermination};
pub use session::{FailedTask, FailureReason, Session, SessionError, SessionSummary};
pub use settings::{ConfigError, LaunchMode, SessionSettings};
pub use status::{StatusItem, StatusSender, StatusUpdateData};
pub use stop::StopSignal;
pub use task::Task;
pub use worker::{ComputeNode, CoreRange, Worker, WorkerHost, WorkerPool};
