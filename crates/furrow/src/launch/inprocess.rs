//! Run tasks inside the scheduler process. This is only really useful for
//! scheduler tests, where it also records every launch so invariants can be
//! asserted after a run.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{LaunchError, LaunchedTask, Launcher, TaskTermination};
use crate::{Task, Worker};

pub struct InProcessTaskInfo {
    pub task_id: String,
    pub worker_id: usize,
}

pub struct InProcessLauncher<F, FUNC>
where
    F: Future<Output = Result<TaskTermination, LaunchError>> + Send + 'static,
    FUNC: Fn(InProcessTaskInfo) -> F + Send + Sync + 'static,
{
    task_fn: FUNC,
    pub launches: LaunchLog,
}

impl<F, FUNC> InProcessLauncher<F, FUNC>
where
    F: Future<Output = Result<TaskTermination, LaunchError>> + Send + 'static,
    FUNC: Fn(InProcessTaskInfo) -> F + Send + Sync + 'static,
{
    pub fn new(task_fn: FUNC) -> Self {
        Self {
            task_fn,
            launches: LaunchLog::default(),
        }
    }
}

#[async_trait]
impl<F, FUNC> Launcher for InProcessLauncher<F, FUNC>
where
    F: Future<Output = Result<TaskTermination, LaunchError>> + Send + 'static,
    FUNC: Fn(InProcessTaskInfo) -> F + Send + Sync + 'static,
{
    type Launched = InProcessTask;

    async fn launch(
        &self,
        task: &Task,
        worker: &Worker,
    ) -> Result<InProcessTask, Report<LaunchError>> {
        self.launches.start(&task.id, worker.id);
        let future = (self.task_fn)(InProcessTaskInfo {
            task_id: task.id.clone(),
            worker_id: worker.id,
        });

        Ok(InProcessTask {
            handle: Some(tokio::task::spawn(future)),
            log: self.launches.clone(),
            worker_id: worker.id,
            finished: false,
        })
    }
}

pub struct InProcessTask {
    handle: Option<JoinHandle<Result<TaskTermination, LaunchError>>>,
    log: LaunchLog,
    worker_id: usize,
    finished: bool,
}

impl InProcessTask {
    fn mark_finished(&mut self) {
        if !self.finished {
            self.finished = true;
            self.log.finish(self.worker_id);
        }
    }
}

#[async_trait]
impl LaunchedTask for InProcessTask {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<TaskTermination, Report<LaunchError>> {
        let Some(handle) = self.handle.take() else {
            return Err(Report::new(LaunchError::Lost));
        };

        let result = handle.await;
        self.mark_finished();
        result
            .map_err(|_| Report::new(LaunchError::Lost))?
            .map_err(Report::new)
    }

    async fn kill(&mut self) -> Result<(), Report<LaunchError>> {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
        self.mark_finished();
        Ok(())
    }
}

/// Shared record of which tasks were started on which workers. All clones
/// point at the same log.
#[derive(Clone, Default)]
pub struct LaunchLog {
    inner: Arc<Mutex<LaunchLogInner>>,
}

#[derive(Default)]
struct LaunchLogInner {
    started: Vec<(String, usize)>,
    active_workers: Vec<usize>,
    max_active: usize,
    worker_overlap: bool,
}

impl LaunchLog {
    fn start(&self, task_id: &str, worker_id: usize) {
        let mut inner = self.inner.lock();
        if inner.active_workers.contains(&worker_id) {
            inner.worker_overlap = true;
        }
        inner.active_workers.push(worker_id);
        inner.max_active = inner.max_active.max(inner.active_workers.len());
        inner.started.push((task_id.to_string(), worker_id));
    }

    fn finish(&self, worker_id: usize) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.active_workers.iter().position(|id| *id == worker_id) {
            inner.active_workers.remove(pos);
        }
    }

    /// Every (task id, worker id) launch, in dispatch order.
    pub fn started(&self) -> Vec<(String, usize)> {
        self.inner.lock().started.clone()
    }

    /// The largest number of tasks that were ever in flight at once.
    pub fn max_active(&self) -> usize {
        self.inner.lock().max_active
    }

    /// True if some worker ever had two unfinished tasks at the same time.
    pub fn worker_overlap(&self) -> bool {
        self.inner.lock().worker_overlap
    }
}
