//! Request window sent to the crash backend.
//!
//! All three instants are kept as `MM/dd/yyyy HH:mm` strings in UTC, which is
//! what the backend expects on the wire. Whatever zone the caller hands in,
//! the stored value is normalized on construction.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::{CrashError, CrashResult};
use crate::types::Device;

pub const REQUEST_TIME_FORMAT: &str = "%m/%d/%Y %H:%M";

#[derive(Debug, Clone, Serialize)]
pub struct TimeWindow {
    start: String,
    end: String,
    last_fetch: String,
    test_case_id: String,
    device: Device,
    image_name: String,
}

impl TimeWindow {
    /// Build a window from caller-formatted local times in `zone`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_zoned(
        start: &str,
        end: &str,
        last_fetch: &str,
        input_format: &str,
        zone: FixedOffset,
        test_case_id: impl Into<String>,
        device: Device,
        image_name: impl Into<String>,
    ) -> CrashResult<Self> {
        Ok(Self {
            start: normalize(start, input_format, zone)?,
            end: normalize(end, input_format, zone)?,
            last_fetch: normalize(last_fetch, input_format, zone)?,
            test_case_id: test_case_id.into(),
            device,
            image_name: image_name.into(),
        })
    }

    pub fn from_instants<Tz: TimeZone>(
        start: &DateTime<Tz>,
        end: &DateTime<Tz>,
        last_fetch: &DateTime<Tz>,
        test_case_id: impl Into<String>,
        device: Device,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            start: format_request_time(&start.with_timezone(&Utc)),
            end: format_request_time(&end.with_timezone(&Utc)),
            last_fetch: format_request_time(&last_fetch.with_timezone(&Utc)),
            test_case_id: test_case_id.into(),
            device,
            image_name: image_name.into(),
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    pub fn last_fetch(&self) -> &str {
        &self.last_fetch
    }

    pub fn test_case_id(&self) -> &str {
        &self.test_case_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn start_instant(&self) -> CrashResult<DateTime<Utc>> {
        parse_request_time(&self.start)
    }

    pub fn end_instant(&self) -> CrashResult<DateTime<Utc>> {
        parse_request_time(&self.end)
    }

    pub fn shift_start(&mut self, minutes: i64) -> CrashResult<&str> {
        self.start = add_minutes(&self.start, minutes)?;
        Ok(&self.start)
    }

    pub fn shift_end(&mut self, minutes: i64) -> CrashResult<&str> {
        self.end = add_minutes(&self.end, minutes)?;
        Ok(&self.end)
    }

    /// Drop the signing suffix the build system appends to image names.
    pub fn sanitize_image_name(&mut self) {
        if let Some(pos) = self.image_name.find("-signed") {
            self.image_name.truncate(pos);
        }
    }

    /// True when `instant` falls inside `[start, end]` at minute resolution.
    pub fn contains(&self, instant: &DateTime<Utc>) -> CrashResult<bool> {
        let start = self.start_instant()?;
        let end = self.end_instant()? + Duration::seconds(59);
        Ok(*instant >= start && *instant <= end)
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "start={} end={} image={} mac={}",
            self.start, self.end, self.image_name, self.device.mac
        )
    }
}

pub fn normalize(value: &str, input_format: &str, zone: FixedOffset) -> CrashResult<String> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), input_format).map_err(|_| {
        CrashError::Timestamp {
            value: value.to_string(),
            format: input_format.to_string(),
        }
    })?;
    let local = zone
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| CrashError::Timestamp {
            value: value.to_string(),
            format: input_format.to_string(),
        })?;
    Ok(format_request_time(&local.with_timezone(&Utc)))
}

pub fn format_request_time(time: &DateTime<Utc>) -> String {
    time.format(REQUEST_TIME_FORMAT).to_string()
}

pub fn parse_request_time(value: &str) -> CrashResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, REQUEST_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| CrashError::Timestamp {
            value: value.to_string(),
            format: REQUEST_TIME_FORMAT.to_string(),
        })
}

fn add_minutes(value: &str, minutes: i64) -> CrashResult<String> {
    let shifted = parse_request_time(value)? + Duration::minutes(minutes);
    Ok(format_request_time(&shifted))
}
