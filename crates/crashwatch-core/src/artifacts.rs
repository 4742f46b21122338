//! Crash artifact downloads into the per-test crash folder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backend::CrashBackendClient;
use crate::cancel::with_deadline;
use crate::error::CrashResult;
use crate::types::{CrashRecord, Device, DumpKind};

pub const CRASH_FOLDER_NAME: &str = "Crash-Analysis";

/// `<root>/<testCaseId>/<cleanMac>/Crash-Analysis`
pub fn crash_folder(output_root: &Path, test_case_id: &str, clean_mac: &str) -> PathBuf {
    output_root
        .join(test_case_id)
        .join(clean_mac)
        .join(CRASH_FOLDER_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Not running inside a CI workspace.
    Skipped,
    Downloaded { companions: bool },
    Failed,
}

pub struct ArtifactDownloader {
    backend: Arc<dyn CrashBackendClient>,
    output_root: PathBuf,
    enabled: bool,
    call_timeout: Duration,
}

impl ArtifactDownloader {
    pub fn new(
        backend: Arc<dyn CrashBackendClient>,
        output_root: PathBuf,
        in_ci_workspace: bool,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            output_root,
            enabled: in_ci_workspace,
            call_timeout,
        }
    }

    /// Fetch the crash's dump into its crash folder. Never fails the caller.
    pub async fn download(&self, device: &Device, test_case_id: &str, crash: &CrashRecord) -> DownloadOutcome {
        info!("Proceed to download dump - {}", self.enabled);
        if !self.enabled {
            return DownloadOutcome::Skipped;
        }

        let target = crash_folder(&self.output_root, test_case_id, &device.clean_mac());
        match self.fetch_into(&target, crash).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Dump download for {} failed: {}", crash.id, e);
                DownloadOutcome::Failed
            }
        }
    }

    async fn fetch_into(&self, target: &Path, crash: &CrashRecord) -> CrashResult<DownloadOutcome> {
        info!("Downloading crash to {:?}", target);
        tokio::fs::create_dir_all(target).await?;

        let kind = crash.kind();
        info!("Downloading {} for id {}", kind, crash.id);
        let primary = with_deadline("dump download", self.call_timeout, |token| async move {
            self.backend.download(kind, &crash.id, target, &token).await
        })
        .await;
        let primary = match primary {
            Ok(ok) => ok,
            Err(e) => {
                error!("Primary artifact for {} failed: {}", crash.id, e);
                false
            }
        };
        info!("Download status {}", primary);

        let mut companions = false;
        if kind == DumpKind::Minidump {
            info!("Downloading compressed files");
            companions = with_deadline("companion download", self.call_timeout, |token| async move {
                self.backend
                    .download_compressed_companions(kind, &crash.id, target, &token)
                    .await
            })
            .await
            .unwrap_or_else(|e| {
                warn!("Compressed companions for {} failed: {}", crash.id, e);
                false
            });
        }

        if primary {
            Ok(DownloadOutcome::Downloaded { companions })
        } else {
            warn!("## -----> Dump file could not be downloaded <----- ##");
            Ok(DownloadOutcome::Failed)
        }
    }
}
