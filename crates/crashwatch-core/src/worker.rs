//! One crash analysis session, from trigger line to tickets.
//!
//! ```text
//! Init -> SendingStartRequest -> Polling -> CrashesFound -> PerCrashProcessing -> Done
//!                              |          -> ExhaustedNoCrashes -> Done
//!                              -> StartFailed -> FailureTicket -> Done
//! ```
//!
//! The session never propagates an error to its caller; everything ends in a
//! [`SessionOutcome`]. A panic while handling one crash only loses that crash.
//! Panics in the other phases reach whoever awaits [`CrashAnalysisWorker::run`].

use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::artifacts::{crash_folder, ArtifactDownloader};
use crate::backend::CrashBackendClient;
use crate::cancel::with_deadline;
use crate::config::CrashAnalysisConfig;
use crate::correlate::{execution_log_path, StepTimeCorrelator};
use crate::error::CrashResult;
use crate::registry::{synthetic_step_ids, CrashCountRegistry};
use crate::report::{StepReporter, StepResult};
use crate::ticket::{EnrichmentHooks, TicketComposer, TicketSink};
use crate::trigger::DumpKinds;
use crate::types::{CrashRecord, DumpKind};
use crate::window::TimeWindow;

static WORKER_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    SendingStartRequest,
    Polling,
    CrashesFound,
    PerCrashProcessing,
    ExhaustedNoCrashes,
    StartFailed,
    FailureTicket,
    Done,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Init => "INIT",
            WorkerState::SendingStartRequest => "SENDING_START_REQUEST",
            WorkerState::Polling => "POLLING",
            WorkerState::CrashesFound => "CRASHES_FOUND",
            WorkerState::PerCrashProcessing => "PER_CRASH_PROCESSING",
            WorkerState::ExhaustedNoCrashes => "EXHAUSTED_NO_CRASHES",
            WorkerState::StartFailed => "START_FAILED",
            WorkerState::FailureTicket => "FAILURE_TICKET",
            WorkerState::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Backend never started; `ticket` is the failure ticket id if one was filed.
    StartFailed { ticket: Option<String> },
    /// Polling ran out without a single crash. No ticket is filed.
    Exhausted { iterations: u32 },
    CrashesFound { crashes: usize, first_step_ordinal: u64 },
    Aborted { reason: String },
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::StartFailed { .. } => "start_failed",
            SessionOutcome::Exhausted { .. } => "exhausted",
            SessionOutcome::CrashesFound { .. } => "crashes_found",
            SessionOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Collaborators shared by every session of the process.
#[derive(Clone)]
pub struct CrashServices {
    pub backend: Arc<dyn CrashBackendClient>,
    pub registry: Arc<CrashCountRegistry>,
    pub reporter: Arc<dyn StepReporter>,
    pub tickets: Option<Arc<dyn TicketSink>>,
    pub hooks: Arc<dyn EnrichmentHooks>,
    pub config: Arc<CrashAnalysisConfig>,
}

pub struct CrashAnalysisWorker {
    name: String,
    services: CrashServices,
    window: TimeWindow,
    kinds: DumpKinds,
    state: WorkerState,
}

impl CrashAnalysisWorker {
    pub fn new(services: CrashServices, window: TimeWindow, trigger_line: &str) -> Self {
        let name = format!(
            "CrashAnalysis-{}-{}-THREAD_{}",
            window.test_case_id(),
            window.device().clean_mac(),
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            name,
            services,
            window,
            kinds: DumpKinds::from_trigger_line(trigger_line),
            state: WorkerState::Init,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Crash folder of this session, also the log path of its diagnostic span.
    pub fn log_path(&self) -> PathBuf {
        crash_folder(
            &self.services.config.output_root,
            self.window.test_case_id(),
            &self.window.device().clean_mac(),
        )
    }

    pub async fn run(mut self) -> SessionOutcome {
        let log_path = self.log_path();
        let span = info_span!(
            "crash_analysis",
            worker = %self.name,
            device = %self.window.device().clean_mac(),
            log_path = %log_path.display(),
        );

        async move {
            let outcome = match self.execute(&log_path).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Exception during crash analysis {} : {}", self.name, e);
                    SessionOutcome::Aborted { reason: e.to_string() }
                }
            };
            self.transition(WorkerState::Done);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self, log_path: &Path) -> CrashResult<SessionOutcome> {
        if let Err(e) = tokio::fs::create_dir_all(log_path).await {
            warn!("Could not create crash folder {:?}: {}", log_path, e);
        }
        info!("Inside crash analysis ------->");

        self.window.sanitize_image_name();
        info!("Starting crash analysis with request {}", self.window);

        self.transition(WorkerState::SendingStartRequest);
        let started = self.send_start_requests().await;
        if started.is_empty() {
            return Ok(self.start_failed().await);
        }

        let start = self.window.shift_start(-1)?.to_string();
        debug!("Window start moved back to {}", start);

        self.transition(WorkerState::Polling);
        let crashes = self.poll(&started).await?;
        if crashes.is_empty() {
            self.transition(WorkerState::ExhaustedNoCrashes);
            let iterations = self.services.config.poll_iterations();
            warn!("No crashes observed after {} iterations, no ticket raised", iterations);
            return Ok(SessionOutcome::Exhausted { iterations });
        }

        self.transition(WorkerState::CrashesFound);
        info!("Total crashes observed {}", crashes.len());
        let device_id = self.window.device().mac.clone();
        let prior = self
            .services
            .registry
            .reserve(&device_id, self.window.test_case_id(), crashes.len() as u64);

        self.transition(WorkerState::PerCrashProcessing);
        self.process_crashes(&crashes, prior).await;
        info!("XXX -------------  Crash Analysis Completed ------------- XXX");

        Ok(SessionOutcome::CrashesFound {
            crashes: crashes.len(),
            first_step_ordinal: prior + 1,
        })
    }

    async fn send_start_requests(&self) -> Vec<DumpKind> {
        let config = &self.services.config;
        let backend = self.services.backend.as_ref();
        let window = &self.window;
        let mut started = Vec::new();

        for kind in self.kinds.iter() {
            info!("Starting processing of {}s if any", kind);
            let result = with_deadline("start processing", config.call_timeout(), |token| async move {
                backend.start_processing(kind, window, &token).await
            })
            .await;
            let ok = result.unwrap_or_else(|e| {
                error!("Start request for {} failed: {}", kind, e);
                false
            });
            info!("Status of processing {}s {}", kind, ok);

            if kind == DumpKind::Minidump {
                tokio::time::sleep(config.start_settle()).await;
            }
            if ok {
                started.push(kind);
            }
        }
        started
    }

    async fn start_failed(&mut self) -> SessionOutcome {
        self.transition(WorkerState::StartFailed);
        error!("Processing of dumps was not successful. Creating ticket in response to failure");

        let step_id = self.services.registry.next_failure_step();
        self.report(&step_id).await;

        self.transition(WorkerState::FailureTicket);
        let ticket = match self.ticket_sink() {
            Some(sink) => {
                let composer = self.composer();
                let request = composer
                    .compose_failure_ticket(self.window.device(), self.window.test_case_id(), &step_id)
                    .await;
                match sink.create_ticket(&request).await {
                    Ok(id) => {
                        info!("Created/Updated ticket {} on crash analysis failure", id);
                        Some(id)
                    }
                    Err(e) => {
                        error!("Failure ticket could not be created: {}", e);
                        None
                    }
                }
            }
            None => None,
        };
        SessionOutcome::StartFailed { ticket }
    }

    async fn poll(&mut self, started: &[DumpKind]) -> CrashResult<Vec<CrashRecord>> {
        let config = self.services.config.clone();
        let mut accumulated = Vec::new();

        for iteration in 1..=config.poll_iterations() {
            info!("ITERATION COUNT : {}, sleeping for {:?}", iteration, config.poll_interval());
            tokio::time::sleep(config.poll_interval()).await;
            let end = self.window.shift_end(1)?.to_string();

            for kind in started {
                info!("Fetching details of {} between {} - {}", kind, self.window.start(), end);
                let backend = self.services.backend.as_ref();
                let window = &self.window;
                let fetched = with_deadline("fetch crashes", config.call_timeout(), |token| async move {
                    backend.fetch(*kind, window, &token).await
                })
                .await
                .unwrap_or_else(|e| {
                    warn!("Fetching {}s failed: {}", kind, e);
                    Vec::new()
                });
                info!("Total number of {}s processed -------> {}", kind, fetched.len());
                accumulated.extend(fetched);
            }

            if !accumulated.is_empty() {
                break;
            }
            info!("No crashes observed");
        }
        Ok(accumulated)
    }

    async fn process_crashes(&self, crashes: &[CrashRecord], prior: u64) {
        let config = &self.services.config;
        let downloader = ArtifactDownloader::new(
            self.services.backend.clone(),
            config.output_root.clone(),
            config.in_ci_workspace(),
            config.call_timeout(),
        );

        let step_ids = synthetic_step_ids(prior, crashes.len() as u64);
        for (crash, step_id) in crashes.iter().zip(step_ids) {
            let handled = AssertUnwindSafe(self.process_crash(&downloader, crash, &step_id))
                .catch_unwind()
                .await;
            if let Err(panic) = handled {
                error!("Processing of crash {} panicked: {}", crash.id, panic_message(&*panic));
            }
        }
    }

    async fn process_crash(&self, downloader: &ArtifactDownloader, crash: &CrashRecord, step_id: &str) {
        info!("Downloading and creating ticket for {} : Details \n {}", step_id, crash);
        self.report(step_id).await;

        let downloaded = downloader
            .download(self.window.device(), self.window.test_case_id(), crash)
            .await;
        debug!("Download outcome for {}: {:?}", crash.id, downloaded);

        if let Some(sink) = self.ticket_sink() {
            if let Err(e) = self.ticket_crash(sink.as_ref(), crash, step_id).await {
                error!("Ticket for {} could not be created: {}", crash.id, e);
            }
        }
    }

    async fn ticket_crash(&self, sink: &dyn TicketSink, crash: &CrashRecord, step_id: &str) -> CrashResult<()> {
        let config = &self.services.config;
        let device = self.window.device();
        let test_case_id = self.window.test_case_id();

        let correlator = StepTimeCorrelator::new(config.log_offset()?);
        let log = execution_log_path(&config.output_root, &device.model, &device.clean_mac());
        let entries = correlator.load(&log, test_case_id, &device.clean_mac()).await;
        let step = correlator.correlate(crash.date_crashed.as_deref(), &entries);
        info!("Crash {} attributed to {}", crash.id, step);

        let request = self
            .composer()
            .compose_crash_ticket(device, test_case_id, step_id, &step.to_string(), crash)
            .await;
        let id = sink.create_ticket(&request).await?;
        info!("The issue tickets created/updated are ------->{}", id);
        Ok(())
    }

    async fn report(&self, step_id: &str) {
        let result = StepResult::crash_post_condition(self.window.device(), self.window.test_case_id(), step_id);
        match self.services.reporter.report_step(&result).await {
            Ok(()) => debug!("Reported post condition step {}", step_id),
            Err(e) => error!("Could not report step {}: {}", step_id, e),
        }
    }

    fn ticket_sink(&self) -> Option<Arc<dyn TicketSink>> {
        if !self.services.config.ticketing_enabled {
            return None;
        }
        let sink = self.services.tickets.clone();
        if sink.is_none() {
            warn!("Ticketing enabled but no ticket sink configured");
        }
        sink
    }

    fn composer(&self) -> TicketComposer {
        TicketComposer::new(self.services.hooks.clone(), self.services.config.clone())
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
