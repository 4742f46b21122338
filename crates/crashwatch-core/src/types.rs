//! Devices, crash records and crash portal timestamps.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CrashError, CrashResult};

/// Date format of crash timestamps served by the crash portal,
/// e.g. `Fri May 17 14:10:44 UTC 2019`.
pub const CRASH_PORTAL_TIME_FORMAT: &str = "EEE MMM dd HH:mm:ss z yyyy";

// Zone token is resolved separately, see `zone_offset`.
const PORTAL_TIME_NO_ZONE: &str = "%a %b %d %H:%M:%S %Y";

// Zone abbreviations the portal is known to emit, as seconds east of UTC.
const ZONE_OFFSETS: &[(&str, i32)] = &[
    ("UTC", 0),
    ("GMT", 0),
    ("UT", 0),
    ("Z", 0),
    ("EST", -5 * 3600),
    ("EDT", -4 * 3600),
    ("CST", -6 * 3600),
    ("CDT", -5 * 3600),
    ("MST", -7 * 3600),
    ("MDT", -6 * 3600),
    ("PST", -8 * 3600),
    ("PDT", -7 * 3600),
    ("BST", 3600),
    ("CET", 3600),
    ("CEST", 2 * 3600),
    ("IST", 5 * 3600 + 1800),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpKind {
    Minidump,
    Coredump,
}

impl DumpKind {
    pub const ALL: [DumpKind; 2] = [DumpKind::Minidump, DumpKind::Coredump];

    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::Minidump => "minidump",
            DumpKind::Coredump => "coredump",
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device under test, as far as crash analysis cares about it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub mac: String,
    pub model: String,
    pub firmware_version: String,
}

impl Device {
    pub fn new(mac: impl Into<String>, model: impl Into<String>, firmware_version: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            model: model.into(),
            firmware_version: firmware_version.into(),
        }
    }

    /// MAC address without colons, used in paths, log filters and worker names.
    pub fn clean_mac(&self) -> String {
        clean_mac(&self.mac)
    }
}

pub fn clean_mac(mac: &str) -> String {
    mac.replace(':', "")
}

/// One crash instance as reported by the crash backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: String,
    pub app: String,
    pub mac: String,
    pub version: String,
    pub device_model: String,
    /// Backend format, see [`CRASH_PORTAL_TIME_FORMAT`].
    pub date_crashed: Option<String>,
    pub date_reported: Option<String>,
    pub date_built: Option<String>,
    pub signature: String,
    pub failed_reason: String,
    pub filename: String,
    pub device_type: String,
    pub crashed_reason: Option<String>,
    pub stack_trace: Option<String>,
    pub is_minidump: bool,
    pub is_coredump: bool,
}

impl CrashRecord {
    pub fn kind(&self) -> DumpKind {
        if self.is_coredump {
            DumpKind::Coredump
        } else {
            DumpKind::Minidump
        }
    }

    /// Only minidumps carry a stack trace worth attaching.
    pub fn reportable_stack_trace(&self) -> Option<&str> {
        if self.kind() != DumpKind::Minidump {
            return None;
        }
        self.stack_trace
            .as_deref()
            .filter(|trace| !trace.trim().is_empty())
    }

    pub fn crashed_at(&self) -> Option<CrashResult<DateTime<Utc>>> {
        self.date_crashed.as_deref().map(parse_portal_time)
    }
}

impl fmt::Display for CrashRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CrashRecord[id={}, app={}, mac={}, version={}, model={}, crashed={}, signature={}, reason={}, file={}, kind={}]",
            self.id,
            self.app,
            self.mac,
            self.version,
            self.device_model,
            self.date_crashed.as_deref().unwrap_or("-"),
            self.signature,
            self.failed_reason,
            self.filename,
            self.kind(),
        )
    }
}

/// Parse a crash portal timestamp such as `Fri May 17 14:10:44 UTC 2019`.
///
/// The zone may be one of the abbreviations in `ZONE_OFFSETS` or a numeric
/// offset (`+0530`, `-05:00`). Any other zone is an error.
pub fn parse_portal_time(value: &str) -> CrashResult<DateTime<Utc>> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(portal_time_error(value));
    }
    let offset = zone_offset(fields[4]).ok_or_else(|| portal_time_error(value))?;
    let without_zone = format!(
        "{} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], fields[5]
    );
    let naive = NaiveDateTime::parse_from_str(&without_zone, PORTAL_TIME_NO_ZONE)
        .map_err(|_| portal_time_error(value))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| portal_time_error(value))
}

fn zone_offset(zone: &str) -> Option<FixedOffset> {
    if let Some((_, secs)) = ZONE_OFFSETS.iter().find(|(name, _)| name.eq_ignore_ascii_case(zone)) {
        return FixedOffset::east_opt(*secs);
    }
    let (sign, digits) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn format_portal_time(time: &DateTime<Utc>) -> String {
    time.format("%a %b %d %H:%M:%S UTC %Y").to_string()
}

fn portal_time_error(value: &str) -> CrashError {
    CrashError::Timestamp {
        value: value.to_string(),
        format: CRASH_PORTAL_TIME_FORMAT.to_string(),
    }
}

/// Test execution the crash was observed in.
#[derive(Debug, Clone)]
pub struct TestSession {
    pub device: Device,
    pub test_case_id: String,
    pub started_at: DateTime<Utc>,
    pub image_name: String,
}

impl TestSession {
    pub fn new(device: Device, test_case_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let image_name = device.firmware_version.clone();
        Self {
            device,
            test_case_id: test_case_id.into(),
            started_at,
            image_name,
        }
    }
}
