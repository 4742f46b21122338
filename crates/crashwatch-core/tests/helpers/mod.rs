#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crashwatch_core::{
    CancelToken, CrashAnalysisConfig, CrashBackendClient, CrashCountRegistry, CrashError, CrashRecord,
    CrashResult, CrashServices, Device, DumpKind, NoEnrichment, StepReporter, StepResult, TicketRequest,
    TicketSink, TimeWindow,
};

pub const MAC: &str = "AA:BB:CC:DD:EE:FF";
pub const TC: &str = "TC-100";

/// Scripted crash backend that records every call it receives.
#[derive(Default)]
pub struct MockBackend {
    pub start_minidump: bool,
    pub start_coredump: bool,
    pub minidump_batches: Mutex<VecDeque<Vec<CrashRecord>>>,
    pub coredump_batches: Mutex<VecDeque<Vec<CrashRecord>>>,
    pub failing_downloads: Vec<String>,
    pub panicking_downloads: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn starting(minidump: bool, coredump: bool) -> Self {
        Self {
            start_minidump: minidump,
            start_coredump: coredump,
            ..Default::default()
        }
    }

    pub fn with_batches(self, kind: DumpKind, batches: Vec<Vec<CrashRecord>>) -> Self {
        let queue = match kind {
            DumpKind::Minidump => &self.minidump_batches,
            DumpKind::Coredump => &self.coredump_batches,
        };
        queue.lock().unwrap().extend(batches);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_batch(&self, kind: DumpKind) -> Vec<CrashRecord> {
        let queue = match kind {
            DumpKind::Minidump => &self.minidump_batches,
            DumpKind::Coredump => &self.coredump_batches,
        };
        queue.lock().unwrap().pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl CrashBackendClient for MockBackend {
    fn is_enabled(&self, _device: &Device) -> bool {
        true
    }

    async fn start_minidump_processing(&self, window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<bool> {
        self.record(format!("start minidump {}", window.image_name()));
        Ok(self.start_minidump)
    }

    async fn start_coredump_processing(&self, window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<bool> {
        self.record(format!("start coredump {}", window.image_name()));
        Ok(self.start_coredump)
    }

    async fn fetch_minidumps(&self, window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        self.record(format!("fetch minidump {} - {}", window.start(), window.end()));
        Ok(self.next_batch(DumpKind::Minidump))
    }

    async fn fetch_coredumps(&self, window: &TimeWindow, _cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        self.record(format!("fetch coredump {} - {}", window.start(), window.end()));
        Ok(self.next_batch(DumpKind::Coredump))
    }

    async fn download(&self, kind: DumpKind, id: &str, dest: &Path, _cancel: &CancelToken) -> CrashResult<bool> {
        self.record(format!("download {} {}", kind, id));
        if self.panicking_downloads.iter().any(|f| f == id) {
            panic!("download of {} blew up", id);
        }
        if self.failing_downloads.iter().any(|f| f == id) {
            return Err(CrashError::Backend(format!("{} unavailable", id)));
        }
        tokio::fs::write(dest.join(format!("{}.dmp", id)), b"dump").await?;
        Ok(true)
    }

    async fn download_compressed_companions(
        &self,
        kind: DumpKind,
        id: &str,
        dest: &Path,
        _cancel: &CancelToken,
    ) -> CrashResult<bool> {
        self.record(format!("companions {} {}", kind, id));
        tokio::fs::write(dest.join(format!("{}.logs.tgz", id)), b"tgz").await?;
        Ok(true)
    }

    async fn is_file_known(&self, _kind: DumpKind, _filename: &str) -> CrashResult<bool> {
        Ok(false)
    }

    async fn lookup_by_filename(&self, _kind: DumpKind, _filename: &str) -> CrashResult<Option<CrashRecord>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub steps: Mutex<Vec<StepResult>>,
}

impl RecordingReporter {
    pub fn step_ids(&self) -> Vec<String> {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.step_id.clone())
            .collect()
    }
}

#[async_trait]
impl StepReporter for RecordingReporter {
    async fn report_step(&self, result: &StepResult) -> CrashResult<()> {
        self.steps.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Ticket sink that fails any request whose summary contains `fail_on`.
#[derive(Default)]
pub struct RecordingSink {
    pub fail_on: Option<String>,
    pub tickets: Mutex<Vec<TicketRequest>>,
}

impl RecordingSink {
    pub fn tickets(&self) -> Vec<TicketRequest> {
        self.tickets.lock().unwrap().clone()
    }
}

#[async_trait]
impl TicketSink for RecordingSink {
    async fn create_ticket(&self, request: &TicketRequest) -> CrashResult<String> {
        if let Some(marker) = &self.fail_on {
            if request.summary.contains(marker.as_str()) {
                return Err(CrashError::Ticketing("tracker rejected request".into()));
            }
        }
        let mut tickets = self.tickets.lock().unwrap();
        tickets.push(request.clone());
        Ok(format!("T-{}", tickets.len()))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub reporter: Arc<RecordingReporter>,
    pub sink: Arc<RecordingSink>,
    pub registry: Arc<CrashCountRegistry>,
    pub config: Arc<CrashAnalysisConfig>,
}

impl Harness {
    pub fn new(backend: MockBackend) -> Self {
        Self::with_sink(backend, RecordingSink::default())
    }

    pub fn with_sink(backend: MockBackend, sink: RecordingSink) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let config = CrashAnalysisConfig {
            ticketing_enabled: true,
            poll_interval_ms: 5,
            start_settle_ms: 0,
            call_timeout_secs: 5,
            output_root: workspace.join("target"),
            workspace: Some(workspace),
            job_url: "https://ci/job/nightly/".into(),
            build_number: "42".into(),
            build_url: "https://ci/job/nightly/42/".into(),
            ..Default::default()
        };
        Self {
            dir,
            backend: Arc::new(backend),
            reporter: Arc::new(RecordingReporter::default()),
            sink: Arc::new(sink),
            registry: Arc::new(CrashCountRegistry::new()),
            config: Arc::new(config),
        }
    }

    pub fn services(&self) -> CrashServices {
        CrashServices {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            reporter: self.reporter.clone(),
            tickets: Some(self.sink.clone()),
            hooks: Arc::new(NoEnrichment),
            config: self.config.clone(),
        }
    }
}

pub fn device() -> Device {
    Device::new(MAC, "XG1", "XG1_5.2sprint_VBN-signed_20190517")
}

/// Window anchored at 14:10 with `end` at 14:20 on 2019-05-17.
pub fn window() -> TimeWindow {
    let start = Utc.with_ymd_and_hms(2019, 5, 17, 14, 10, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2019, 5, 17, 14, 20, 0).unwrap();
    let device = device();
    let image = device.firmware_version.clone();
    TimeWindow::from_instants(&start, &end, &end, TC, device, image)
}

pub fn crash(id: &str, kind: DumpKind) -> CrashRecord {
    CrashRecord {
        id: id.to_string(),
        app: "Receiver".into(),
        mac: MAC.into(),
        version: "XG1_5.2sprint_VBN".into(),
        device_model: "XG1".into(),
        date_crashed: Some("Fri May 17 14:12:44 UTC 2019".into()),
        signature: format!("sig-{}", id),
        failed_reason: "SIGSEGV".into(),
        filename: format!("{}.dmp", id),
        stack_trace: Some("#0 main".into()),
        is_minidump: kind == DumpKind::Minidump,
        is_coredump: kind == DumpKind::Coredump,
        ..Default::default()
    }
}
