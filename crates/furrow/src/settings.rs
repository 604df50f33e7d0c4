use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors in the session configuration. All of these surface at session
/// construction, before any task is dispatched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("The node list is empty")]
    EmptyNodeList,
    #[error("Worker slots per node resolved to zero")]
    ZeroProcessesPerNode,
    #[error("Node {address} has {cores} cores but {slots} worker slots were requested")]
    TooFewCores {
        address: String,
        cores: u32,
        slots: u32,
    },
    #[error("Task at position {index} has an empty {field}")]
    InvalidTask { index: usize, field: &'static str },
}

/// How task processes are started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchMode {
    /// Execute the launch script directly.
    Basic,
    /// Delegate core pinning and host placement to an external parallel
    /// process launcher.
    Wrapper { bin: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Cores available on each node, used to derive the worker count when
    /// `processes_per_node` is not set explicitly.
    pub cores_per_node: u32,
    /// Cores reserved for each dispatched task.
    pub cores_per_task: u32,
    /// Explicit worker slots per node, overriding the derived value.
    pub processes_per_node: Option<u32>,
    pub launcher: LaunchMode,
    /// Retain generated launch scripts on disk after their task finishes.
    pub keep_scripts: bool,
    /// How often the stop file is checked while waiting on completions.
    #[serde(with = "duration_secs")]
    pub stop_check_interval: Duration,
    /// Kill a task that runs longer than this. `None` lets a hung task hold
    /// its worker indefinitely.
    #[serde(with = "opt_duration_secs")]
    pub task_timeout: Option<Duration>,
    /// Directory where launch scripts are written.
    pub work_dir: PathBuf,
    pub stop_file: Option<PathBuf>,
    /// When non-empty, the stop file only triggers if one of its lines
    /// contains this substring.
    pub stop_magic: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cores_per_node: 1,
            cores_per_task: 1,
            processes_per_node: None,
            launcher: LaunchMode::Basic,
            keep_scripts: false,
            stop_check_interval: Duration::from_secs(2),
            task_timeout: None,
            work_dir: PathBuf::from("."),
            stop_file: None,
            stop_magic: String::new(),
        }
    }
}

impl SessionSettings {
    /// Worker slots to create on each node: the explicit setting if present,
    /// otherwise `cores_per_node / cores_per_task`.
    pub fn processes_per_node(&self) -> Result<u32, Report<ConfigError>> {
        let slots = match self.processes_per_node {
            Some(explicit) => explicit,
            None if self.cores_per_task == 0 => 0,
            None => self.cores_per_node / self.cores_per_task,
        };

        if slots == 0 {
            Err(
                Report::new(ConfigError::ZeroProcessesPerNode).attach_printable(format!(
                    "cores_per_node = {}, cores_per_task = {}",
                    self.cores_per_node, self.cores_per_task
                )),
            )
        } else {
            Ok(slots)
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_slots_from_core_counts() {
        let settings = SessionSettings {
            cores_per_node: 8,
            cores_per_task: 2,
            ..Default::default()
        };
        assert_eq!(settings.processes_per_node().expect("deriving slots"), 4);
    }

    #[test]
    fn explicit_slot_count_wins() {
        let settings = SessionSettings {
            cores_per_node: 8,
            cores_per_task: 2,
            processes_per_node: Some(3),
            ..Default::default()
        };
        assert_eq!(settings.processes_per_node().expect("deriving slots"), 3);
    }

    #[test]
    fn zero_slots_is_an_error() {
        let settings = SessionSettings {
            cores_per_node: 1,
            cores_per_task: 4,
            ..Default::default()
        };
        assert!(settings.processes_per_node().is_err());

        let settings = SessionSettings {
            processes_per_node: Some(0),
            ..Default::default()
        };
        assert!(settings.processes_per_node().is_err());
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = SessionSettings {
            launcher: LaunchMode::Wrapper {
                bin: PathBuf::from("mpiexec.hydra"),
            },
            task_timeout: Some(Duration::from_secs(30)),
            stop_magic: "STOP_ALL".to_string(),
            ..Default::default()
        };

        let json = serde_json::to_string(&settings).expect("serializing settings");
        let parsed: SessionSettings = serde_json::from_str(&json).expect("parsing settings");
        assert_eq!(parsed.launcher, settings.launcher);
        assert_eq!(parsed.task_timeout, settings.task_timeout);
        assert_eq!(parsed.stop_magic, settings.stop_magic);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: SessionSettings =
            serde_json::from_str(r#"{"cores_per_node": 16}"#).expect("parsing settings");
        assert_eq!(parsed.cores_per_node, 16);
        assert_eq!(parsed.launcher, LaunchMode::Basic);
        assert!(!parsed.keep_scripts);
    }
}
