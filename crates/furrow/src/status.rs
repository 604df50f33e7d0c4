use std::fmt;

use time::OffsetDateTime;

use crate::launch::TaskTermination;

#[derive(Debug, Clone)]
pub enum StatusUpdateData {
    Launched { pid: Option<u32> },
    Finished { termination: TaskTermination },
    LaunchFailed { message: String },
    TimedOut,
    Failed { message: String },
}

impl fmt::Display for StatusUpdateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusUpdateData::Launched { pid: Some(pid) } => write!(f, "launched (pid {pid})"),
            StatusUpdateData::Launched { pid: None } => f.write_str("launched"),
            StatusUpdateData::Finished { termination } => write!(f, "finished ({termination})"),
            StatusUpdateData::LaunchFailed { message } => {
                write!(f, "failed to launch: {message}")
            }
            StatusUpdateData::TimedOut => f.write_str("timed out"),
            StatusUpdateData::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

/// One lifecycle event for one task.
#[derive(Debug, Clone)]
pub struct StatusItem {
    pub task_id: String,
    pub worker_id: usize,
    pub timestamp: OffsetDateTime,
    pub data: StatusUpdateData,
}

impl fmt::Display for StatusItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{timestamp} task {task} worker {worker}: {data}",
            timestamp = self.timestamp,
            task = self.task_id,
            worker = self.worker_id,
            data = self.data
        )
    }
}

/// Sends task lifecycle events to an observer. `add` never blocks, and a
/// dropped receiver is ignored so the session can always emit.
#[derive(Clone)]
pub struct StatusSender {
    tx: Option<flume::Sender<StatusItem>>,
}

impl StatusSender {
    pub fn new() -> (Self, flume::Receiver<StatusItem>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn add(&self, task_id: String, worker_id: usize, data: StatusUpdateData) {
        if let Some(tx) = &self.tx {
            tx.send(StatusItem {
                task_id,
                worker_id,
                timestamp: OffsetDateTime::now_utc(),
                data,
            })
            .ok();
        }
    }
}
