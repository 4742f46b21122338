//! Backend and service fixtures for dispatcher and tail tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use crashwatch_core::{
    CancelToken, CrashAnalysisConfig, CrashBackendClient, CrashCountRegistry, CrashRecord, CrashResult,
    CrashServices, Device, DumpKind, NoEnrichment, TimeWindow,
};
use crashwatch_portal::StepJournal;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Backend whose start requests wait for a permit on `gate`.
pub struct GatedBackend {
    pub gate: Semaphore,
    pub started: Notify,
    starts: AtomicUsize,
}

impl Default for GatedBackend {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: Notify::new(),
            starts: AtomicUsize::new(0),
        }
    }
}

impl GatedBackend {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrashBackendClient for GatedBackend {
    fn is_enabled(&self, _device: &Device) -> bool {
        true
    }

    async fn start_minidump_processing(&self, _window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<bool> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Ok(true)
    }

    async fn start_coredump_processing(&self, _window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<bool> {
        Ok(false)
    }

    async fn fetch_minidumps(&self, _window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        Ok(Vec::new())
    }

    async fn fetch_coredumps(&self, _window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        Ok(Vec::new())
    }

    async fn download(&self, _kind: DumpKind, _id: &str, _dest: &Path, _cancel: &CancelToken) -> CrashResult<bool> {
        Ok(false)
    }

    async fn download_compressed_companions(
        &self,
        _kind: DumpKind,
        _id: &str,
        _dest: &Path,
        _cancel: &CancelToken,
    ) -> CrashResult<bool> {
        Ok(false)
    }

    async fn is_file_known(&self, _kind: DumpKind, _filename: &str) -> CrashResult<bool> {
        Ok(false)
    }

    async fn lookup_by_filename(&self, _kind: DumpKind, _filename: &str) -> CrashResult<Option<CrashRecord>> {
        Ok(None)
    }
}

pub fn services(backend: Arc<dyn CrashBackendClient>, root: &Path) -> CrashServices {
    let config = CrashAnalysisConfig {
        poll_interval_ms: 1,
        start_settle_ms: 0,
        call_timeout_secs: 30,
        output_root: root.join("target"),
        ..Default::default()
    };
    CrashServices {
        backend,
        registry: Arc::new(CrashCountRegistry::new()),
        reporter: Arc::new(StepJournal::open(root.join("steps.ndjson")).unwrap()),
        tickets: None,
        hooks: Arc::new(NoEnrichment),
        config: Arc::new(config),
    }
}

pub fn device() -> Device {
    Device::new("AA:BB:CC:DD:EE:FF", "XG1", "XG1_5.2s1_VBN")
}

pub fn window() -> TimeWindow {
    let at = Utc.with_ymd_and_hms(2019, 5, 17, 14, 10, 0).unwrap();
    TimeWindow::from_instants(&at, &at, &at, "TC-100", device(), "XG1_5.2s1_VBN")
}
