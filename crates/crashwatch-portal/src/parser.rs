//! Crash records as exported by the crash portal.

use crashwatch_core::{CrashRecord, DumpKind};
use serde::{Deserialize, Serialize};

/// Crash record as exported by the crash portal (camelCase JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireCrashRecord {
    pub id: String,
    pub app: String,
    pub mac: String,
    pub version: String,
    pub device_model: String,
    pub date_crashed: Option<String>,
    pub date_reported: Option<String>,
    pub date_built: Option<String>,
    pub signature: String,
    pub failed_reason: String,
    pub filename: String,
    pub device_type: String,
    pub crashed_reason: Option<String>,
    pub stack_trace: Option<String>,
}

impl WireCrashRecord {
    /// The dump kind comes from where the record was found, not from the record.
    pub fn into_record(self, kind: DumpKind) -> CrashRecord {
        CrashRecord {
            id: self.id,
            app: self.app,
            mac: self.mac,
            version: self.version,
            device_model: self.device_model,
            date_crashed: self.date_crashed,
            date_reported: self.date_reported,
            date_built: self.date_built,
            signature: self.signature,
            failed_reason: self.failed_reason,
            filename: self.filename,
            device_type: self.device_type,
            crashed_reason: self.crashed_reason,
            stack_trace: self.stack_trace,
            is_minidump: kind == DumpKind::Minidump,
            is_coredump: kind == DumpKind::Coredump,
        }
    }
}

/// Parse one exported record of `kind`.
pub fn parse_record(json: &str, kind: DumpKind) -> anyhow::Result<CrashRecord> {
    let wire: WireCrashRecord = serde_json::from_str(json)?;
    if wire.id.trim().is_empty() {
        return Err(anyhow::anyhow!("Crash record missing 'id' field"));
    }
    Ok(wire.into_record(kind))
}
