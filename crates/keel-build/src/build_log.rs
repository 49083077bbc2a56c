//! Per-application build logs.
//!
//! Each application keeps a fixed number of recent lines. The buffer is
//! always full (padded with empty lines after a clear) and
//! `first_line_number` grows by one on every logged line, so a client
//! polling the status can tell which lines it has already seen.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_core::BuildLogLines;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BuildLog {
    size: usize,
    lines: VecDeque<String>,
    first_line_number: i64,
    is_build_failed: bool,
}

impl BuildLog {
    pub fn new(size: usize) -> Self {
        let mut log = Self {
            size,
            lines: VecDeque::with_capacity(size),
            first_line_number: 0,
            is_build_failed: false,
        };
        log.clear();
        log
    }

    pub fn clear(&mut self) {
        self.is_build_failed = false;
        self.first_line_number = -(self.size as i64);
        self.lines.clear();
        self.lines.resize(self.size, String::new());
    }

    pub fn log(&mut self, msg: &str) {
        self.lines.pop_front();
        self.lines.push_back(msg.to_string());
        self.first_line_number += 1;
        debug!(target: "keel::build", "{msg}");
    }

    /// Append the terminal failure lines and mark the build failed.
    pub fn on_build_failed(&mut self, error: &str) {
        self.log("----------------------");
        self.log("Deploy failed!");
        self.log(error);
        self.is_build_failed = true;
    }

    pub fn is_build_failed(&self) -> bool {
        self.is_build_failed
    }

    /// Snapshot of the buffer. Lines and counter are copied together.
    pub fn logs(&self) -> BuildLogLines {
        BuildLogLines {
            lines: self.lines.iter().cloned().collect(),
            first_line_number: self.first_line_number,
        }
    }
}

/// Build logs of every application, created on first use.
#[derive(Clone)]
pub struct BuildLogsManager {
    size: usize,
    logs: Arc<Mutex<HashMap<String, BuildLog>>>,
}

impl BuildLogsManager {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            logs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BuildLog>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_log<R>(&self, app: &str, f: impl FnOnce(&mut BuildLog) -> R) -> R {
        let mut logs = self.lock();
        let log = logs
            .entry(app.to_string())
            .or_insert_with(|| BuildLog::new(self.size));
        f(log)
    }

    /// Handle bound to one application's log.
    pub fn for_app(&self, app: &str) -> AppBuildLog {
        AppBuildLog {
            manager: self.clone(),
            app: app.to_string(),
        }
    }

    pub fn logs(&self, app: &str) -> BuildLogLines {
        self.with_log(app, |l| l.logs())
    }

    pub fn is_build_failed(&self, app: &str) -> bool {
        self.with_log(app, |l| l.is_build_failed())
    }

    pub fn remove(&self, app: &str) {
        self.lock().remove(app);
    }
}

#[derive(Clone)]
pub struct AppBuildLog {
    manager: BuildLogsManager,
    app: String,
}

impl AppBuildLog {
    pub fn log(&self, msg: impl AsRef<str>) {
        self.manager.with_log(&self.app, |l| l.log(msg.as_ref()));
    }

    pub fn clear(&self) {
        self.manager.with_log(&self.app, BuildLog::clear);
    }

    pub fn on_build_failed(&self, error: &str) {
        self.manager.with_log(&self.app, |l| l.on_build_failed(error));
    }

    pub fn app(&self) -> &str {
        &self.app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_log_is_padded() {
        let log = BuildLog::new(3);
        let snapshot = log.logs();
        assert_eq!(snapshot.lines, vec!["", "", ""]);
        assert_eq!(snapshot.first_line_number, -3);
    }

    #[test]
    fn test_ring_drops_oldest_and_counts() {
        let mut log = BuildLog::new(3);
        for i in 0..5 {
            log.log(&format!("line {i}"));
        }
        let snapshot = log.logs();
        assert_eq!(snapshot.lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(snapshot.first_line_number, 2);
    }

    #[test]
    fn test_failure_sets_flag_until_clear() {
        let mut log = BuildLog::new(5);
        log.on_build_failed("boom");
        assert!(log.is_build_failed());
        assert_eq!(log.logs().lines[4], "boom");
        assert_eq!(log.logs().lines[3], "Deploy failed!");

        log.clear();
        assert!(!log.is_build_failed());
        assert_eq!(log.logs().first_line_number, -5);
    }

    #[test]
    fn test_manager_keeps_logs_per_app() {
        let manager = BuildLogsManager::new(2);
        manager.for_app("api").log("hello");
        assert_eq!(manager.logs("api").lines, vec!["", "hello"]);
        assert_eq!(manager.logs("worker").lines, vec!["", ""]);

        manager.remove("api");
        assert_eq!(manager.logs("api").first_line_number, -2);
    }
}
