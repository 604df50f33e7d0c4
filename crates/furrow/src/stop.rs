//! Operator-triggered cooperative abort via an on-disk signal file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use tracing::{event, Level};

/// Watches a user-writable stop file. The session checks this between
/// dispatches and while waiting on completions; it never kills running
/// child processes.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    path: Option<PathBuf>,
    magic: String,
}

impl StopSignal {
    pub fn new(path: Option<PathBuf>, magic: impl Into<String>) -> Self {
        Self {
            path,
            magic: magic.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// True when the stop file exists and, if a magic string is configured,
    /// one of its lines contains that substring.
    pub fn should_stop(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        if !path.exists() {
            return false;
        }

        if self.magic.is_empty() {
            event!(Level::INFO, path = %path.display(), "Stop file present");
            return true;
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                event!(Level::WARN, path = %path.display(), %error, "Failed to open stop file");
                return false;
            }
        };

        for line in BufReader::new(file).lines() {
            match line {
                Ok(line) if line.contains(&self.magic) => {
                    event!(Level::INFO, path = %path.display(), "Stop file contains stop marker");
                    return true;
                }
                Ok(_) => {}
                Err(error) => {
                    event!(Level::WARN, path = %path.display(), %error, "Failed to read stop file");
                    return false;
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_signal_never_stops() {
        assert!(!StopSignal::disabled().should_stop());
    }

    #[test]
    fn missing_file_does_not_stop() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let signal = StopSignal::new(Some(dir.path().join("stop")), "");
        assert!(!signal.should_stop());
    }

    #[test]
    fn presence_alone_stops_without_magic() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let path = dir.path().join("stop");
        std::fs::write(&path, "anything at all").expect("writing stop file");

        let signal = StopSignal::new(Some(path), "");
        assert!(signal.should_stop());
    }

    #[test]
    fn magic_requires_a_matching_line() {
        let dir = tempfile::TempDir::new().expect("creating temp dir");
        let path = dir.path().join("stop");

        std::fs::write(&path, "nothing relevant\nstill nothing\n").expect("writing stop file");
        let signal = StopSignal::new(Some(path.clone()), "STOP_ALL");
        assert!(!signal.should_stop());

        std::fs::write(&path, "prefix STOP_ALL suffix\n").expect("writing stop file");
        assert!(signal.should_stop());
    }
}
