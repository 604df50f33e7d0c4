use async_trait::async_trait;
use error_stack::Report;

use super::{LaunchError, Launcher};
use crate::{Task, Worker};

/// Wraps another launcher and injects launch failures, for tests that
/// exercise the session's failure isolation.
pub struct FailingLauncher<L, F>
where
    L: Launcher,
    F: Fn(&Task, &Worker) -> Result<(), LaunchError> + Send + Sync + 'static,
{
    inner: L,
    fail_fn: F,
}

impl<L, F> FailingLauncher<L, F>
where
    L: Launcher,
    F: Fn(&Task, &Worker) -> Result<(), LaunchError> + Send + Sync + 'static,
{
    pub fn new(inner: L, fail_fn: F) -> Self {
        Self { inner, fail_fn }
    }
}

#[async_trait]
impl<L, F> Launcher for FailingLauncher<L, F>
where
    L: Launcher,
    F: Fn(&Task, &Worker) -> Result<(), LaunchError> + Send + Sync + 'static,
{
    type Launched = L::Launched;

    async fn launch(
        &self,
        task: &Task,
        worker: &Worker,
    ) -> Result<Self::Launched, Report<LaunchError>> {
        (self.fail_fn)(task, worker).map_err(Report::new)?;
        self.inner.launch(task, worker).await
    }
}
