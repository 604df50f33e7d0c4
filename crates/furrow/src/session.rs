//! The session scheduler: dispatches tasks to free workers in source order,
//! reaps completions, and recycles workers until the task list is drained.

use std::collections::VecDeque;

use ahash::{HashMap, HashMapExt};
use error_stack::{Report, ResultExt};
use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::launch::{LaunchedTask, Launcher, TaskTermination};
use crate::settings::{ConfigError, SessionSettings};
use crate::status::{StatusSender, StatusUpdateData};
use crate::stop::StopSignal;
use crate::worker::{ComputeNode, WorkerPool};
use crate::Task;

/// Task-to-worker ratio above which grouping tasks into larger units is
/// recommended.
const GROUPING_RATIO: usize = 20;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session configuration")]
    Config,
    #[error("Stop requested through the stop file")]
    StopRequested,
}

#[derive(Debug, Clone)]
pub enum FailureReason {
    /// The task ran and ended with a non-zero code or a signal.
    Exit(TaskTermination),
    /// The task could not be started.
    Launch(String),
    /// The task outlived the configured timeout and was killed.
    TimedOut,
    /// The task started but its process could no longer be observed.
    Lost(String),
}

#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task_id: String,
    pub reason: FailureReason,
}

#[derive(Debug, Default)]
pub struct SessionSummary {
    /// Tasks that were successfully handed to the launcher.
    pub launched: usize,
    /// Tasks that ran to completion with exit code 0.
    pub completed: usize,
    pub failed: Vec<FailedTask>,
}

impl SessionSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

enum TaskOutcome {
    Finished(TaskTermination),
    TimedOut,
    Lost(String),
}

struct CompletionEvent {
    worker_id: usize,
    task: Task,
    outcome: TaskOutcome,
}

/// A single batch run. Owns the worker pool, the ordered task queue, and the
/// stop signal; generic over the launcher so scheduling can be tested without
/// real processes.
///
/// The driver is a single decision-maker: one dispatch loop owns the free
/// queue and the running set, and one lightweight future per in-flight task
/// waits on the OS process and yields a completion event.
pub struct Session<L: Launcher> {
    settings: SessionSettings,
    launcher: L,
    workers: WorkerPool,
    pending: VecDeque<Task>,
    stop: StopSignal,
    status: StatusSender,
}

impl<L: Launcher> std::fmt::Debug for Session<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("settings", &self.settings)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<L: Launcher> Session<L> {
    /// Build a session, validating the configuration up front. Bad settings,
    /// an unusable node list, or a malformed task are rejected here rather
    /// than at first dispatch.
    pub fn new(
        settings: SessionSettings,
        launcher: L,
        nodes: &[ComputeNode],
        tasks: impl IntoIterator<Item = Task>,
        status: StatusSender,
    ) -> Result<Self, Report<SessionError>> {
        let pending: VecDeque<Task> = tasks.into_iter().collect();
        for (index, task) in pending.iter().enumerate() {
            let field = if task.id.is_empty() {
                Some("id")
            } else if task.launch_cmd.is_empty() {
                Some("command")
            } else {
                None
            };
            if let Some(field) = field {
                return Err(Report::new(ConfigError::InvalidTask { index, field })
                    .change_context(SessionError::Config));
            }
        }

        let slots_per_node = settings
            .processes_per_node()
            .change_context(SessionError::Config)?;
        let workers =
            WorkerPool::load(nodes, slots_per_node).change_context(SessionError::Config)?;
        let stop = StopSignal::new(settings.stop_file.clone(), settings.stop_magic.clone());

        Ok(Self {
            settings,
            launcher,
            workers,
            pending,
            stop,
            status,
        })
    }

    pub fn total_workers(&self) -> usize {
        self.workers.total()
    }

    pub fn free_workers(&self) -> usize {
        self.workers.free_count()
    }

    /// Dispatch every pending task and wait for all of them to finish.
    ///
    /// Tasks go out in source order; a task waits until a worker is free.
    /// Launch failures and non-zero exits are recorded and the session moves
    /// on; only a stop request ends the run early, leaving in-flight child
    /// processes to the OS. Calling `run` again after it returns is a no-op.
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> Result<SessionSummary, Report<SessionError>> {
        self.size_warnings();

        let mut summary = SessionSummary::default();
        let mut running = FuturesUnordered::new();
        // worker id -> id of the task it is bound to
        let mut active: HashMap<usize, String> = HashMap::new();

        while let Some(task) = self.pending.pop_front() {
            let worker_id = loop {
                if self.stop.should_stop() {
                    event!(
                        Level::WARN,
                        abandoned = self.pending.len() + 1,
                        in_flight = ?active,
                        "Stop requested; abandoning queued tasks"
                    );
                    return Err(Report::new(SessionError::StopRequested));
                }
                if let Some(id) = self.workers.checkout() {
                    break id;
                }

                debug_assert!(!running.is_empty());
                match tokio::time::timeout(self.settings.stop_check_interval, running.next()).await
                {
                    Ok(Some(completion)) => self.reap(completion, &mut active, &mut summary),
                    // Timer tick, or nothing in flight: go back around and
                    // check the stop file.
                    Ok(None) | Err(_) => {}
                }
            };

            let worker = self.workers.get(worker_id);
            match self.launcher.launch(&task, worker).await {
                Ok(mut launched) => {
                    event!(
                        Level::DEBUG,
                        task = %task.id,
                        worker = worker_id,
                        cores = %worker.cores,
                        host = %worker.host.address,
                        "Dispatched task"
                    );
                    self.status.add(
                        task.id.clone(),
                        worker_id,
                        StatusUpdateData::Launched {
                            pid: launched.pid(),
                        },
                    );
                    summary.launched += 1;
                    active.insert(worker_id, task.id.clone());

                    let timeout = self.settings.task_timeout;
                    running.push(async move {
                        let outcome = match timeout {
                            Some(limit) => {
                                match tokio::time::timeout(limit, launched.wait()).await {
                                    Ok(Ok(termination)) => TaskOutcome::Finished(termination),
                                    Ok(Err(error)) => TaskOutcome::Lost(format!("{error:?}")),
                                    Err(_) => {
                                        launched.kill().await.ok();
                                        TaskOutcome::TimedOut
                                    }
                                }
                            }
                            None => match launched.wait().await {
                                Ok(termination) => TaskOutcome::Finished(termination),
                                Err(error) => TaskOutcome::Lost(format!("{error:?}")),
                            },
                        };
                        launched.cleanup().await.ok();
                        CompletionEvent {
                            worker_id,
                            task,
                            outcome,
                        }
                    });
                }
                Err(error) => {
                    event!(
                        Level::ERROR,
                        task = %task.id,
                        cmd = %task.launch_cmd,
                        ?error,
                        "Failed to launch task"
                    );
                    self.status.add(
                        task.id.clone(),
                        worker_id,
                        StatusUpdateData::LaunchFailed {
                            message: error.to_string(),
                        },
                    );
                    summary.failed.push(FailedTask {
                        task_id: task.id,
                        reason: FailureReason::Launch(error.to_string()),
                    });
                    self.workers.checkin(worker_id);
                }
            }
        }

        // Everything has been dispatched; drain the in-flight tasks.
        while !running.is_empty() {
            if self.stop.should_stop() {
                event!(
                    Level::WARN,
                    in_flight = ?active,
                    "Stop requested while draining"
                );
                return Err(Report::new(SessionError::StopRequested));
            }
            match tokio::time::timeout(self.settings.stop_check_interval, running.next()).await {
                Ok(Some(completion)) => self.reap(completion, &mut active, &mut summary),
                Ok(None) => break,
                Err(_) => {}
            }
        }

        event!(
            Level::INFO,
            completed = summary.completed,
            failed = summary.failed.len(),
            "All tasks completed"
        );
        Ok(summary)
    }

    /// Record a finished task and return its worker to the free queue.
    fn reap(
        &mut self,
        completion: CompletionEvent,
        active: &mut HashMap<usize, String>,
        summary: &mut SessionSummary,
    ) {
        let CompletionEvent {
            worker_id,
            task,
            outcome,
        } = completion;

        match outcome {
            TaskOutcome::Finished(termination) if termination.success() => {
                event!(Level::DEBUG, task = %task.id, worker = worker_id, "Task finished");
                self.status.add(
                    task.id,
                    worker_id,
                    StatusUpdateData::Finished { termination },
                );
                summary.completed += 1;
            }
            TaskOutcome::Finished(termination) => {
                event!(
                    Level::WARN,
                    task = %task.id,
                    cmd = %task.launch_cmd,
                    %termination,
                    "Task failed"
                );
                self.status.add(
                    task.id.clone(),
                    worker_id,
                    StatusUpdateData::Finished { termination },
                );
                summary.failed.push(FailedTask {
                    task_id: task.id,
                    reason: FailureReason::Exit(termination),
                });
            }
            TaskOutcome::TimedOut => {
                event!(
                    Level::WARN,
                    task = %task.id,
                    cmd = %task.launch_cmd,
                    "Task timed out and was killed"
                );
                self.status
                    .add(task.id.clone(), worker_id, StatusUpdateData::TimedOut);
                summary.failed.push(FailedTask {
                    task_id: task.id,
                    reason: FailureReason::TimedOut,
                });
            }
            TaskOutcome::Lost(message) => {
                event!(
                    Level::ERROR,
                    task = %task.id,
                    cmd = %task.launch_cmd,
                    %message,
                    "Task process was lost"
                );
                self.status.add(
                    task.id.clone(),
                    worker_id,
                    StatusUpdateData::Failed {
                        message: message.clone(),
                    },
                );
                summary.failed.push(FailedTask {
                    task_id: task.id,
                    reason: FailureReason::Lost(message),
                });
            }
        }

        active.remove(&worker_id);
        self.workers.checkin(worker_id);
        debug_assert_eq!(
            active.len() + self.workers.free_count(),
            self.workers.total()
        );
    }

    fn size_warnings(&self) {
        let num_tasks = self.pending.len();
        let num_workers = self.workers.total();
        if num_tasks % num_workers != 0 {
            event!(
                Level::WARN,
                num_tasks,
                num_workers,
                "Task count is not a multiple of the worker count; consider grouping tasks"
            );
        }
        if num_tasks > num_workers * GROUPING_RATIO {
            event!(
                Level::WARN,
                num_tasks,
                num_workers,
                "High task-to-worker ratio; consider grouping tasks"
            );
        }
    }
}
