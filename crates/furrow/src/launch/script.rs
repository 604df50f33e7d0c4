//! Launch tasks as OS processes through generated launch scripts.
//!
//! Every launch writes a small shell script into the work directory. The
//! script is both the exec target and an operator-inspectable record of what
//! ran where; the child's environment comes directly from the spawn call
//! rather than from `export` lines in the script.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use tokio::process::{Child, Command};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use super::{LaunchError, LaunchedTask, Launcher, TaskTermination};
use crate::settings::{LaunchMode, SessionSettings};
use crate::{Task, Worker};

pub struct ScriptLauncher {
    work_dir: PathBuf,
    job_id: Uuid,
    mode: LaunchMode,
    cores_per_task: u32,
    keep_scripts: bool,
}

impl ScriptLauncher {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            work_dir: settings.work_dir.clone(),
            job_id: Uuid::now_v7(),
            mode: settings.launcher.clone(),
            cores_per_task: settings.cores_per_task,
            keep_scripts: settings.keep_scripts,
        }
    }

    fn script_path(&self, task: &Task, worker: &Worker) -> PathBuf {
        self.work_dir.join(format!(
            "task-{host}-id{worker}-{job}.{task}",
            host = worker.host.address,
            worker = worker.id,
            job = self.job_id,
            task = task.id
        ))
    }

    /// Write the launch record: a shebang line and the task command prefixed
    /// by a `cd` into the driver's working directory. Mode 0755.
    async fn write_launch_file(
        &self,
        task: &Task,
        worker: &Worker,
    ) -> Result<PathBuf, Report<LaunchError>> {
        let path = self.script_path(task, worker);
        let cwd = std::env::current_dir().change_context(LaunchError::ScriptWrite)?;
        let body = format!(
            "#!/bin/sh\ncd '{cwd}' && {cmd}\n",
            cwd = cwd.display(),
            cmd = task.launch_cmd
        );

        tokio::fs::write(&path, body)
            .await
            .change_context(LaunchError::ScriptWrite)
            .attach_printable_lazy(|| path.display().to_string())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .change_context(LaunchError::ScriptWrite)
                .attach_printable_lazy(|| path.display().to_string())?;
        }

        Ok(path)
    }

    fn build_command(&self, script: &Path, worker: &Worker) -> Command {
        match &self.mode {
            LaunchMode::Basic => Command::new(script),
            LaunchMode::Wrapper { bin } => {
                let mut command = Command::new(bin);
                command
                    .arg("-env")
                    .arg("I_MPI_PIN_PROCESSOR_LIST")
                    .arg(worker.cores.to_string())
                    .arg("-n")
                    .arg(self.cores_per_task.to_string())
                    .arg("-host")
                    .arg(&worker.host.address)
                    .arg(script);
                command
            }
        }
    }
}

#[async_trait]
impl Launcher for ScriptLauncher {
    type Launched = ScriptTask;

    #[instrument(skip(self, task, worker), fields(task = %task.id, worker = worker.id))]
    async fn launch(
        &self,
        task: &Task,
        worker: &Worker,
    ) -> Result<ScriptTask, Report<LaunchError>> {
        let script = self.write_launch_file(task, worker).await?;

        let mut command = self.build_command(&script, worker);
        let child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                if !self.keep_scripts {
                    tokio::fs::remove_file(&script).await.ok();
                }
                return Err(Report::new(error)
                    .change_context(LaunchError::Spawn)
                    .attach_printable(task.launch_cmd.clone()));
            }
        };

        event!(
            Level::DEBUG,
            pid = child.id(),
            script = %script.display(),
            "Spawned task process"
        );

        Ok(ScriptTask {
            script,
            child,
            keep_script: self.keep_scripts,
        })
    }
}

#[derive(Debug)]
pub struct ScriptTask {
    script: PathBuf,
    child: Child,
    keep_script: bool,
}

impl ScriptTask {
    pub fn script(&self) -> &Path {
        &self.script
    }
}

#[async_trait]
impl LaunchedTask for ScriptTask {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<TaskTermination, Report<LaunchError>> {
        let status = self.child.wait().await.change_context(LaunchError::Lost)?;
        Ok(TaskTermination::from_status(status))
    }

    async fn kill(&mut self) -> Result<(), Report<LaunchError>> {
        self.child.kill().await.change_context(LaunchError::Lost)
    }

    async fn cleanup(&mut self) -> Result<(), Report<LaunchError>> {
        if !self.keep_script {
            tokio::fs::remove_file(&self.script)
                .await
                .change_context(LaunchError::ScriptWrite)
                .attach_printable_lazy(|| self.script.display().to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ComputeNode, WorkerPool};

    fn test_worker() -> Worker {
        let pool = WorkerPool::load(
            &[ComputeNode {
                address: "node0".to_string(),
                cores: 4,
            }],
            2,
        )
        .expect("loading pool");
        pool.get(1).clone()
    }

    fn test_settings(dir: &Path) -> SessionSettings {
        SessionSettings {
            work_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn launch_file_has_expected_name_and_contents() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let launcher = ScriptLauncher::new(&test_settings(dir.path()));
        let task = Task::new("t3", "echo hi");
        let worker = test_worker();

        let path = launcher
            .write_launch_file(&task, &worker)
            .await
            .expect("writing launch file");

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("task-node0-id1-"), "name was {name}");
        assert!(name.ends_with(".t3"), "name was {name}");

        let body = std::fs::read_to_string(&path).expect("reading launch file");
        assert!(body.starts_with("#!/bin/sh\n"));
        assert!(body.contains("cd '"));
        assert!(body.trim_end().ends_with("&& echo hi"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("reading metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn wrapper_argv_matches_launcher_convention() {
        let settings = SessionSettings {
            launcher: LaunchMode::Wrapper {
                bin: PathBuf::from("mpiexec.hydra"),
            },
            cores_per_task: 2,
            ..Default::default()
        };
        let launcher = ScriptLauncher::new(&settings);
        let command = launcher.build_command(Path::new("/tmp/launch.sh"), &test_worker());

        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-env",
                "I_MPI_PIN_PROCESSOR_LIST",
                "2-3",
                "-n",
                "2",
                "-host",
                "node0",
                "/tmp/launch.sh",
            ]
        );
    }

    #[tokio::test]
    async fn runs_a_task_and_cleans_up_the_script() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let launcher = ScriptLauncher::new(&test_settings(dir.path()));
        let worker = test_worker();

        let mut running = launcher
            .launch(&Task::new("ok", "true"), &worker)
            .await
            .expect("launching task");
        assert!(running.pid().is_some());
        assert!(running.script().exists());

        let termination = running.wait().await.expect("waiting for task");
        assert!(termination.success());

        running.cleanup().await.expect("cleaning up");
        assert!(!running.script().exists());
    }

    #[tokio::test]
    async fn keep_scripts_retains_the_launch_record() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let settings = SessionSettings {
            keep_scripts: true,
            ..test_settings(dir.path())
        };
        let launcher = ScriptLauncher::new(&settings);

        let mut running = launcher
            .launch(&Task::new("kept", "true"), &test_worker())
            .await
            .expect("launching task");
        running.wait().await.expect("waiting for task");
        running.cleanup().await.expect("cleaning up");
        assert!(running.script().exists());
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let launcher = ScriptLauncher::new(&test_settings(dir.path()));

        let mut running = launcher
            .launch(&Task::new("bad", "exit 3"), &test_worker())
            .await
            .expect("launching task");
        let termination = running.wait().await.expect("waiting for task");
        assert_eq!(termination.code, Some(3));
        assert!(!termination.success());
    }

    #[tokio::test]
    async fn spawn_failure_is_typed_and_removes_the_script() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let settings = SessionSettings {
            launcher: LaunchMode::Wrapper {
                bin: PathBuf::from("/nonexistent/parallel-launcher"),
            },
            ..test_settings(dir.path())
        };
        let launcher = ScriptLauncher::new(&settings);

        let error = launcher
            .launch(&Task::new("lost", "true"), &test_worker())
            .await
            .expect_err("launch should fail");
        assert_eq!(error.current_context(), &LaunchError::Spawn);

        let leftover = std::fs::read_dir(dir.path()).expect("reading dir").count();
        assert_eq!(leftover, 0);
    }
}
