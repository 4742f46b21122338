//! Recognize crash lines in a device trace and anchor the backend window.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::backend::CrashBackendClient;
use crate::error::CrashResult;
use crate::types::{Device, DumpKind, TestSession};
use crate::window::TimeWindow;

// Broadband and camera devices: 2019/05/17-14:10:44
const SLASHED_TIME: &str = r"[0-9]{4}/[0-9]{2}/[0-9]{2}-[0-9]{2}:[0-9]{2}:[0-9]{2}";
const SLASHED_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";
// Video devices: 2019 May 17 14:10:44
const SPELLED_TIME: &str = r"[0-9]{4} [a-zA-Z]{3} [0-9]{1,2} [0-9]{2}:[0-9]{2}:[0-9]{2}";
const SPELLED_FORMAT: &str = "%Y %b %d %H:%M:%S";

/// Dump kinds a trigger line names. Either, both or neither may be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpKinds {
    pub minidump: bool,
    pub coredump: bool,
}

impl DumpKinds {
    pub fn from_trigger_line(line: &str) -> Self {
        Self {
            minidump: line.contains("minidump"),
            coredump: line.contains("coredump"),
        }
    }

    pub fn contains(&self, kind: DumpKind) -> bool {
        match kind {
            DumpKind::Minidump => self.minidump,
            DumpKind::Coredump => self.coredump,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DumpKind> + '_ {
        DumpKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }

    pub fn is_empty(&self) -> bool {
        !self.minidump && !self.coredump
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub line: String,
    pub kinds: DumpKinds,
    pub crash_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CrashTrigger {
    pattern: Regex,
}

impl CrashTrigger {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    pub fn for_backend(backend: &dyn CrashBackendClient, device: &Device) -> CrashResult<Self> {
        Ok(Self::new(backend.crash_signal_pattern(device)?))
    }

    pub fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    pub fn inspect(&self, line: &str) -> Option<TriggerEvent> {
        if !self.matches(line) {
            return None;
        }
        let kinds = DumpKinds::from_trigger_line(line);
        if kinds.is_empty() {
            debug!("Crash signal without a dump kind: {}", line);
        }
        Some(TriggerEvent {
            line: line.to_string(),
            kinds,
            crash_time: extract_crash_time(line),
        })
    }
}

/// Crash instant stamped on a trace line, if it carries one.
pub fn extract_crash_time(line: &str) -> Option<DateTime<Utc>> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [(SLASHED_TIME, SLASHED_FORMAT), (SPELLED_TIME, SPELLED_FORMAT)]
            .into_iter()
            .filter_map(|(pattern, format)| Regex::new(pattern).ok().map(|re| (re, format)))
            .collect()
    });

    for (pattern, format) in patterns {
        if let Some(found) = pattern.find(line) {
            match NaiveDateTime::parse_from_str(found.as_str(), format) {
                Ok(naive) => return Some(naive.and_utc()),
                Err(e) => warn!("Could not parse crash time {}: {}", found.as_str(), e),
            }
        }
    }
    None
}

/// Window for a session: from the crash instant (or session start) to `now`.
pub fn window_for(session: &TestSession, crash_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> TimeWindow {
    let mut start = crash_time.unwrap_or(session.started_at);
    if start > now {
        warn!("Crash time {} is ahead of local clock {}, using now", start, now);
        start = now;
    }
    TimeWindow::from_instants(
        &start,
        &now,
        &now,
        session.test_case_id.clone(),
        session.device.clone(),
        session.image_name.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DEFAULT_CRASH_SIGNAL;
    use chrono::TimeZone;

    fn trigger() -> CrashTrigger {
        CrashTrigger::new(Regex::new(DEFAULT_CRASH_SIGNAL).unwrap())
    }

    #[test]
    fn test_kinds_are_independent() {
        let both = DumpKinds::from_trigger_line("minidump SUCCESS, coredump SUCCESS");
        assert!(both.minidump && both.coredump);
        assert_eq!(both.iter().count(), 2);

        let core = DumpKinds::from_trigger_line("2019/05/17-14:10:44 coredump upload SUCCESS");
        assert!(!core.minidump && core.coredump);
        assert_eq!(core.iter().collect::<Vec<_>>(), vec![DumpKind::Coredump]);

        // Case sensitive, unlike the crash signal.
        assert!(DumpKinds::from_trigger_line("MINIDUMP SUCCESS").is_empty());
    }

    #[test]
    fn test_inspect_matches_signal() {
        let trigger = trigger();
        assert!(trigger.inspect("receiver: normal heartbeat").is_none());

        let event = trigger
            .inspect("2019/05/17-14:10:44 [uploadDumps] minidump upload SUCCESS")
            .unwrap();
        assert!(event.kinds.minidump);
        assert_eq!(event.crash_time, Some(Utc.with_ymd_and_hms(2019, 5, 17, 14, 10, 44).unwrap()));

        assert!(trigger.matches("Coredump upload SUCESS"));
    }

    #[test]
    fn test_extract_spelled_time() {
        let time = extract_crash_time("2019 May 7 09:01:02 receiver coredump SUCCESS");
        assert_eq!(time, Some(Utc.with_ymd_and_hms(2019, 5, 7, 9, 1, 2).unwrap()));
        assert_eq!(extract_crash_time("coredump SUCCESS"), None);
    }

    #[test]
    fn test_window_anchor() {
        let device = Device::new("AA:BB:CC:DD:EE:FF", "XG1", "XG1_5.2s1_VBN-signed");
        let started = Utc.with_ymd_and_hms(2019, 5, 17, 14, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2019, 5, 17, 14, 20, 0).unwrap();
        let session = TestSession::new(device, "TC-100", started);

        let window = window_for(&session, None, now);
        assert_eq!(window.start(), "05/17/2019 14:00");
        assert_eq!(window.end(), "05/17/2019 14:20");
        assert_eq!(window.last_fetch(), window.end());

        let crash = Utc.with_ymd_and_hms(2019, 5, 17, 14, 10, 44).unwrap();
        let window = window_for(&session, Some(crash), now);
        assert_eq!(window.start(), "05/17/2019 14:10");

        let ahead = window_for(&session, Some(now + chrono::Duration::hours(1)), now);
        assert_eq!(ahead.start(), ahead.end());
    }
}
