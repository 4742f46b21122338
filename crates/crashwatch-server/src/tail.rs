//! Follow a device trace file and start a session for every crash line.

use anyhow::Context;
use chrono::Utc;
use crashwatch_core::{window_for, CancelToken, CrashAnalysisWorker, CrashServices, CrashTrigger, TestSession};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, warn};

use crate::dispatcher::CrashDispatcher;
use crate::metrics;

const TAIL_POLL: Duration = Duration::from_millis(250);

pub struct TraceWatch {
    session: TestSession,
    trigger: CrashTrigger,
    services: CrashServices,
}

impl TraceWatch {
    pub fn new(session: TestSession, services: CrashServices) -> anyhow::Result<Self> {
        let trigger = CrashTrigger::for_backend(services.backend.as_ref(), &session.device)
            .context("Failed to build crash signal pattern")?;
        Ok(Self {
            session,
            trigger,
            services,
        })
    }

    /// Crash analysis runs only when both the config and the backend allow it.
    pub fn is_enabled(&self) -> bool {
        self.services.config.enabled && self.services.backend.is_enabled(&self.session.device)
    }

    /// Dispatch a session if `line` is a crash line. Returns true when one was queued.
    pub fn on_line(&self, line: &str, dispatcher: &CrashDispatcher) -> bool {
        let Some(event) = self.trigger.inspect(line) else {
            return false;
        };
        metrics::record_trigger();
        info!("Crash signal in trace: {}", event.line.trim_end());

        let window = window_for(&self.session, event.crash_time, Utc::now());
        let worker = CrashAnalysisWorker::new(self.services.clone(), window, &event.line);
        let name = worker.name().to_string();
        match dispatcher.submit(worker) {
            Ok(()) => {
                debug!("Queued {}", name);
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Read `path` line by line. With `follow` the reader waits for new lines
    /// until `stop` is cancelled; otherwise it returns at end of file.
    pub async fn run(
        &self,
        path: &Path,
        from_start: bool,
        follow: bool,
        dispatcher: &CrashDispatcher,
        stop: &CancelToken,
    ) -> anyhow::Result<u64> {
        if !self.is_enabled() {
            info!("Crash analysis disabled for {}", self.session.device.mac);
            return Ok(0);
        }

        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open trace {:?}", path))?;
        if !from_start {
            file.seek(std::io::SeekFrom::End(0)).await?;
        }
        let mut reader = BufReader::new(file);
        info!("Watching {:?} for crash signals", path);

        let mut dispatched = 0;
        let mut buf = Vec::new();
        loop {
            let read = reader.read_until(b'\n', &mut buf).await?;
            if read > 0 && buf.ends_with(b"\n") {
                // Device traces carry binary noise; decode what is there.
                if self.on_line(&String::from_utf8_lossy(&buf), dispatcher) {
                    dispatched += 1;
                }
                buf.clear();
                continue;
            }

            // End of file, possibly holding a partial line.
            if !follow {
                if !buf.is_empty() && self.on_line(&String::from_utf8_lossy(&buf), dispatcher) {
                    dispatched += 1;
                }
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(TAIL_POLL) => {}
                _ = stop.cancelled() => break,
            }
        }
        info!("Stopped watching {:?}, {} sessions dispatched", path, dispatched);
        Ok(dispatched)
    }
}
