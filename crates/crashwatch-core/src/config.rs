//! Crash analysis configuration.
//!
//! Loaded from TOML, then overlaid with the CI environment (`WORKSPACE`,
//! `JOB_URL`, `BUILD_NUMBER`, `BUILD_URL`, `JMD_ID`, ...).

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CrashError, CrashResult};

/// Upper bound on polling iterations per session; polling has no other deadline.
pub const MAX_POLL_ITERATIONS: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashAnalysisConfig {
    /// Master switch for crash analysis.
    pub enabled: bool,
    /// Open tickets for discovered crashes.
    pub ticketing_enabled: bool,
    pub poll_interval_ms: u64,
    pub max_poll_iterations: u32,
    /// Pause after asking the backend to start minidump processing.
    pub start_settle_ms: u64,
    /// Deadline for a single backend call.
    pub call_timeout_secs: u64,
    /// Root for the execution logs and per-test crash folders (`target/`).
    pub output_root: PathBuf,
    /// CI workspace directory; downloads only happen inside one.
    pub workspace: Option<PathBuf>,
    pub job_url: String,
    pub build_number: String,
    pub build_url: String,
    pub job_id: Option<u64>,
    pub priority: String,
    pub manual_id: String,
    pub build_appender: Option<String>,
    pub environment_type: Option<String>,
    pub sprint_keywords: Vec<String>,
    pub stable_keywords: Vec<String>,
    /// Offset of the execution log's timestamps from UTC.
    pub log_offset_minutes: i32,
    pub max_concurrent_workers: usize,
    pub queue_capacity: usize,
}

impl Default for CrashAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ticketing_enabled: false,
            poll_interval_ms: 60_000,
            max_poll_iterations: MAX_POLL_ITERATIONS,
            start_settle_ms: 1_000,
            call_timeout_secs: 120,
            output_root: PathBuf::from("target"),
            workspace: None,
            job_url: String::new(),
            build_number: String::new(),
            build_url: String::new(),
            job_id: None,
            priority: "P2".to_string(),
            manual_id: "_POSTCONDITION ".to_string(),
            build_appender: None,
            environment_type: None,
            sprint_keywords: Vec::new(),
            stable_keywords: Vec::new(),
            log_offset_minutes: 0,
            max_concurrent_workers: 4,
            queue_capacity: 32,
        }
    }
}

impl CrashAnalysisConfig {
    pub fn from_toml_str(content: &str) -> CrashResult<Self> {
        toml::from_str(content).map_err(|e| CrashError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> CrashResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn apply_process_env(&mut self) -> CrashResult<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> CrashResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(ws) = get("WORKSPACE") {
            self.workspace = Some(PathBuf::from(ws));
        }
        if let Some(url) = get("JOB_URL") {
            self.job_url = url;
        }
        if let Some(number) = get("BUILD_NUMBER") {
            self.build_number = number;
        }
        if let Some(url) = get("BUILD_URL") {
            self.build_url = url;
        }
        if let Some(id) = get("JMD_ID") {
            let id = id
                .trim()
                .parse::<u64>()
                .map_err(|_| CrashError::Config(format!("JMD_ID is not numeric: {}", id)))?;
            self.job_id = Some(id);
        }
        if let Some(flag) = get("CRASH_ANALYSIS_ENABLE") {
            self.enabled = parse_flag("CRASH_ANALYSIS_ENABLE", &flag)?;
        }
        if let Some(flag) = get("CRASH_TICKETING_ENABLE") {
            self.ticketing_enabled = parse_flag("CRASH_TICKETING_ENABLE", &flag)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> CrashResult<()> {
        if self.max_poll_iterations == 0 || self.max_poll_iterations > MAX_POLL_ITERATIONS {
            return Err(CrashError::Config(format!(
                "max_poll_iterations must be between 1 and {}, got {}",
                MAX_POLL_ITERATIONS, self.max_poll_iterations
            )));
        }
        if self.max_concurrent_workers == 0 || self.queue_capacity == 0 {
            return Err(CrashError::Config(
                "max_concurrent_workers and queue_capacity must be positive".into(),
            ));
        }
        self.log_offset()?;
        Ok(())
    }

    /// Configured iterations, never more than [`MAX_POLL_ITERATIONS`].
    pub fn poll_iterations(&self) -> u32 {
        self.max_poll_iterations.min(MAX_POLL_ITERATIONS)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn log_offset(&self) -> CrashResult<FixedOffset> {
        FixedOffset::east_opt(self.log_offset_minutes * 60).ok_or_else(|| {
            CrashError::Config(format!("log offset {} minutes out of range", self.log_offset_minutes))
        })
    }

    /// `<JOB_URL><BUILD_NUMBER>`, the link to the running job.
    pub fn job_link(&self) -> String {
        format!("{}{}", self.job_url, self.build_number)
    }

    /// Full console output of the running build.
    pub fn console_url(&self) -> String {
        format!("{}/consoleFull", self.build_url.trim_end_matches('/'))
    }

    /// True when running inside a CI workspace (directory literally named `workspace`).
    pub fn in_ci_workspace(&self) -> bool {
        self.workspace
            .as_deref()
            .and_then(|ws| ws.file_name())
            .map(|name| name == "workspace")
            .unwrap_or(false)
    }
}

fn parse_flag(key: &str, value: &str) -> CrashResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(CrashError::Config(format!("{} must be a boolean, got {}", key, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_polling_contract() {
        let config = CrashAnalysisConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.max_poll_iterations, 6);
        assert_eq!(config.priority, "P2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_iterations_are_capped() {
        let config = CrashAnalysisConfig {
            max_poll_iterations: 50,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.poll_iterations(), MAX_POLL_ITERATIONS);

        let config = CrashAnalysisConfig {
            max_poll_iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CrashAnalysisConfig {
            max_poll_iterations: 3,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_iterations(), 3);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = CrashAnalysisConfig::from_toml_str(
            r#"
            ticketing_enabled = true
            poll_interval_ms = 250
            sprint_keywords = ["sprint"]
            output_root = "/tmp/run/target"
            "#,
        )
        .unwrap();
        assert!(config.ticketing_enabled);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.sprint_keywords, vec!["sprint"]);
        assert_eq!(config.output_root, PathBuf::from("/tmp/run/target"));
        assert_eq!(config.max_poll_iterations, 6);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("WORKSPACE", "/var/lib/jenkins/jobs/nightly/workspace"),
            ("JOB_URL", "https://ci.example.com/job/nightly/"),
            ("BUILD_NUMBER", "42"),
            ("BUILD_URL", "https://ci.example.com/job/nightly/42/"),
            ("JMD_ID", "9001"),
            ("CRASH_TICKETING_ENABLE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = CrashAnalysisConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(config.in_ci_workspace());
        assert!(config.ticketing_enabled);
        assert_eq!(config.job_id, Some(9001));
        assert_eq!(config.job_link(), "https://ci.example.com/job/nightly/42");
        assert_eq!(config.console_url(), "https://ci.example.com/job/nightly/42/consoleFull");
    }

    #[test]
    fn test_bad_job_id_is_rejected() {
        let mut config = CrashAnalysisConfig::default();
        let result = config.apply_env(|key| (key == "JMD_ID").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_workspace_detection() {
        let mut config = CrashAnalysisConfig::default();
        assert!(!config.in_ci_workspace());
        config.workspace = Some(PathBuf::from("/home/dev/checkout"));
        assert!(!config.in_ci_workspace());
        config.workspace = Some(PathBuf::from("/ci/job/workspace"));
        assert!(config.in_ci_workspace());
    }
}
