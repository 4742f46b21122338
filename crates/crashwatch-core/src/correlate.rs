//! Attribute a crash to the test step that was running when it happened.
//!
//! Step boundaries come from the execution log, one line per step, e.g.
//! `[INFO] 2019-08-08 07:00:19,029 ... TC-100 : AABBCCDDEEFF ... step Number : s3`.
//! A crash belongs to the first step logged strictly after the crash instant.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::parse_portal_time;

pub const TEST_LOG_TIME_FORMAT: &str = "yyyy-MM-dd HH:mm:ss,SSS";

const STEP_LINE_EXTRACT: &str =
    r"\[INFO\].(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}).*step Number : (s\d+(?:\.\d+)?)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLogEntry {
    pub timestamp: String,
    pub step_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAttribution {
    Step(String),
    AfterLast(String),
    FirstStep,
    Undetermined,
}

impl fmt::Display for StepAttribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAttribution::Step(id) => f.write_str(id),
            StepAttribution::AfterLast(id) => write!(f, "the step after completing {}", id),
            StepAttribution::FirstStep => f.write_str("first step"),
            StepAttribution::Undetermined => f.write_str("a step which could not be determined"),
        }
    }
}

/// Execution log of a device: `<root>/logs/<model>-<cleanMac>.log`.
pub fn execution_log_path(output_root: &Path, model: &str, clean_mac: &str) -> PathBuf {
    output_root
        .join("logs")
        .join(format!("{}-{}.log", model, clean_mac))
}

#[derive(Debug, Clone)]
pub struct StepTimeCorrelator {
    log_offset: FixedOffset,
}

impl Default for StepTimeCorrelator {
    fn default() -> Self {
        Self::utc()
    }
}

impl StepTimeCorrelator {
    /// `log_offset` is the zone the execution log writes its timestamps in.
    pub fn new(log_offset: FixedOffset) -> Self {
        Self { log_offset }
    }

    pub fn utc() -> Self {
        Self {
            log_offset: Utc.fix(),
        }
    }

    pub fn scrape(&self, log: &str, test_case_id: &str, clean_mac: &str) -> Vec<StepLogEntry> {
        let filter = format!(
            r"^\[INFO.*{} : {}.*step Number :",
            regex::escape(test_case_id),
            regex::escape(clean_mac)
        );
        let (filter, extract) = match (case_insensitive(&filter), case_insensitive(STEP_LINE_EXTRACT)) {
            (Some(filter), Some(extract)) => (filter, extract),
            _ => {
                warn!("Could not build step filter for {} / {}", test_case_id, clean_mac);
                return Vec::new();
            }
        };

        log.lines()
            .filter(|line| filter.is_match(line))
            .filter_map(|line| {
                let caps = extract.captures(line)?;
                Some(StepLogEntry {
                    timestamp: caps[1].to_string(),
                    step_id: caps[2].to_string(),
                })
            })
            .collect()
    }

    /// Read and scrape the log. A missing log simply has no steps.
    pub async fn load(&self, path: &Path, test_case_id: &str, clean_mac: &str) -> Vec<StepLogEntry> {
        match tokio::fs::read_to_string(path).await {
            Ok(log) => self.scrape(&log, test_case_id, clean_mac),
            Err(e) => {
                warn!("Execution log {:?} not readable: {}", path, e);
                Vec::new()
            }
        }
    }

    pub fn correlate(&self, crash_time: Option<&str>, entries: &[StepLogEntry]) -> StepAttribution {
        let Some(last) = entries.last() else {
            return StepAttribution::FirstStep;
        };
        let Some(crash_time) = crash_time else {
            return StepAttribution::Undetermined;
        };

        let crashed_at = match parse_portal_time(crash_time) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Crash time not usable for correlation: {}", e);
                return StepAttribution::AfterLast(last.step_id.clone());
            }
        };

        for entry in entries {
            match self.parse_log_time(&entry.timestamp) {
                Some(logged_at) if logged_at > crashed_at => {
                    debug!("Crash at {} falls in step {}", crashed_at, entry.step_id);
                    return StepAttribution::Step(entry.step_id.clone());
                }
                Some(_) => {}
                None => warn!(
                    "Unparseable step timestamp {} (expected {})",
                    entry.timestamp, TEST_LOG_TIME_FORMAT
                ),
            }
        }

        StepAttribution::AfterLast(last.step_id.clone())
    }

    fn parse_log_time(&self, value: &str) -> Option<DateTime<Utc>> {
        let dotted = value.replacen(',', ".", 1);
        let naive = NaiveDateTime::parse_from_str(&dotted, "%Y-%m-%d %H:%M:%S%.f").ok()?;
        self.log_offset
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc))
    }
}

fn case_insensitive(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}
