//! Contract with the external crash-reporting backend.

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::{CrashError, CrashResult};
use crate::types::{CrashRecord, Device, DumpKind};
use crate::window::TimeWindow;

/// Trace lines announcing a successful dump upload.
pub const DEFAULT_CRASH_SIGNAL: &str =
    "(?i:minidump.*?SUCCESS|coredump.*?SUCCESS|minidump.*?SUCESS|coredump.*?SUCESS)";

pub const MINIDUMP_UPLOAD_SUCCESS: &str = "S3 minidump Upload is successful with TLS1.2";
pub const COREDUMP_UPLOAD_SUCCESS: &str = "S3 coredump Upload is successful with TLS1.2";
pub const CORE_FILE_UPLOAD_SUCCESS: &str = "Success uploading file";

#[async_trait]
pub trait CrashBackendClient: Send + Sync {
    fn is_enabled(&self, device: &Device) -> bool;

    fn crash_signal_pattern(&self, _device: &Device) -> CrashResult<Regex> {
        Regex::new(DEFAULT_CRASH_SIGNAL).map_err(|e| CrashError::Config(e.to_string()))
    }

    async fn start_minidump_processing(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<bool>;

    async fn start_coredump_processing(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<bool>;

    async fn fetch_minidumps(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>>;

    async fn fetch_coredumps(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>>;

    async fn download(&self, kind: DumpKind, id: &str, dest: &Path, cancel: &CancelToken) -> CrashResult<bool>;

    async fn download_compressed_companions(
        &self,
        kind: DumpKind,
        id: &str,
        dest: &Path,
        cancel: &CancelToken,
    ) -> CrashResult<bool>;

    async fn is_file_known(&self, kind: DumpKind, filename: &str) -> CrashResult<bool>;

    async fn lookup_by_filename(&self, kind: DumpKind, filename: &str) -> CrashResult<Option<CrashRecord>>;

    /// Patterns proving a dump of `kind` left the device, optionally for one process.
    fn success_upload_patterns(&self, _device: &Device, kind: DumpKind, process: Option<&str>) -> Vec<Regex> {
        let upload = match kind {
            DumpKind::Minidump => MINIDUMP_UPLOAD_SUCCESS,
            DumpKind::Coredump => COREDUMP_UPLOAD_SUCCESS,
        };
        let mut patterns = vec![regex::escape(upload)];
        match process {
            Some(name) => patterns.push(format!(
                "{}.*{}",
                regex::escape(CORE_FILE_UPLOAD_SUCCESS),
                regex::escape(name)
            )),
            None => patterns.push(regex::escape(CORE_FILE_UPLOAD_SUCCESS)),
        }
        patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
    }

    async fn start_processing(&self, kind: DumpKind, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<bool> {
        match kind {
            DumpKind::Minidump => self.start_minidump_processing(window, cancel).await,
            DumpKind::Coredump => self.start_coredump_processing(window, cancel).await,
        }
    }

    async fn fetch(&self, kind: DumpKind, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        match kind {
            DumpKind::Minidump => self.fetch_minidumps(window, cancel).await,
            DumpKind::Coredump => self.fetch_coredumps(window, cancel).await,
        }
    }
}
