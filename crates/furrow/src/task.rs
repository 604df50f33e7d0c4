use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single unit of work: a shell command line with a session-unique id, plus
/// any auxiliary paths associated with the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub launch_cmd: String,
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

impl Task {
    pub fn new(id: impl Into<String>, launch_cmd: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            launch_cmd: launch_cmd.into(),
            extra_paths: Vec::new(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{}: {}", self.id, self.launch_cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_paths_default_to_empty() {
        let task: Task =
            serde_json::from_str(r#"{"id": "t0", "launch_cmd": "true"}"#).expect("parsing task");
        assert_eq!(task.id, "t0");
        assert_eq!(task.launch_cmd, "true");
        assert!(task.extra_paths.is_empty());
    }

    #[test]
    fn display_renders_all_fields() {
        let mut task = Task::new("t1", "echo hi");
        task.extra_paths.push(PathBuf::from("/data/in"));

        let rendered = task.to_string();
        assert!(rendered.contains("\"t1\""));
        assert!(rendered.contains("echo hi"));
        assert!(rendered.contains("/data/in"));
    }
}
