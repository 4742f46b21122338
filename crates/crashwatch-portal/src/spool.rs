//! Crash backend served from a local spool directory.
//!
//! ```text
//! <root>/minidump/*.json          one exported record per file
//! <root>/minidump/files/<id>.dmp  primary artifact
//! <root>/minidump/files/<id>.*.tgz compressed companions
//! <root>/coredump/*.json
//! <root>/coredump/files/<id>.core
//! <root>/requests/<kind>-<yyyyMMddHHmm>.json  processing requests
//! ```

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use crashwatch_core::{
    clean_mac, CancelToken, CrashBackendClient, CrashError, CrashRecord, CrashResult, Device, DumpKind, TimeWindow,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::parser::parse_record;

pub struct SpoolBackend {
    root: PathBuf,
    enabled: bool,
}

impl SpoolBackend {
    pub fn new(root: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            root: root.into(),
            enabled,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: DumpKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn files_dir(&self, kind: DumpKind) -> PathBuf {
        self.kind_dir(kind).join("files")
    }

    async fn record_request(&self, kind: DumpKind, window: &TimeWindow, cancel: &CancelToken) -> anyhow::Result<bool> {
        cancel.check("start processing")?;
        if !tokio::fs::try_exists(self.kind_dir(kind)).await.unwrap_or(false) {
            warn!("No {} spool under {:?}", kind, self.root);
            return Ok(false);
        }

        let requests = self.root.join("requests");
        tokio::fs::create_dir_all(&requests)
            .await
            .with_context(|| format!("Failed to create {:?}", requests))?;
        let path = requests.join(format!("{}-{}.json", kind, Utc::now().format("%Y%m%d%H%M")));
        let body = serde_json::to_string_pretty(window)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write request {:?}", path))?;
        info!("Recorded {} processing request {:?}", kind, path);
        Ok(true)
    }

    /// Every parseable record of `kind`, in file name order.
    async fn records(&self, kind: DumpKind) -> anyhow::Result<Vec<CrashRecord>> {
        let dir = self.kind_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            match parse_record(&content, kind) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed record {:?}: {}", path, e),
            }
        }
        Ok(records)
    }

    async fn fetch_window(&self, kind: DumpKind, window: &TimeWindow, cancel: &CancelToken) -> anyhow::Result<Vec<CrashRecord>> {
        cancel.check("fetch crashes")?;
        let device = clean_mac(&window.device().mac).to_ascii_uppercase();
        let mut matched = Vec::new();

        for record in self.records(kind).await? {
            if clean_mac(&record.mac).to_ascii_uppercase() != device {
                continue;
            }
            let at = match record.crashed_at() {
                Some(Ok(at)) => at,
                Some(Err(e)) => {
                    debug!("Record {} has unusable crash time: {}", record.id, e);
                    continue;
                }
                None => {
                    debug!("Record {} has no crash time", record.id);
                    continue;
                }
            };
            if window.contains(&at)? {
                matched.push(record);
            }
        }
        debug!("{} {}s in {}", matched.len(), kind, window);
        Ok(matched)
    }

    async fn copy_primary(&self, kind: DumpKind, id: &str, dest: &Path, cancel: &CancelToken) -> anyhow::Result<bool> {
        let ext = match kind {
            DumpKind::Minidump => "dmp",
            DumpKind::Coredump => "core",
        };
        let name = format!("{}.{}", id, ext);
        let source = self.files_dir(kind).join(&name);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            warn!("No artifact {:?} in spool", source);
            return Ok(false);
        }

        cancel.check("download")?;
        tokio::fs::copy(&source, dest.join(&name))
            .await
            .with_context(|| format!("Failed to copy {:?} into {:?}", source, dest))?;
        Ok(true)
    }

    async fn copy_companions(&self, kind: DumpKind, id: &str, dest: &Path, cancel: &CancelToken) -> anyhow::Result<bool> {
        let dir = self.files_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
        };

        let prefix = format!("{}.", id);
        let mut copied = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with(&prefix) && name.ends_with(".tgz")) {
                continue;
            }
            cancel.check("companion download")?;
            tokio::fs::copy(entry.path(), dest.join(&name))
                .await
                .with_context(|| format!("Failed to copy {}", name))?;
            copied += 1;
        }
        info!("Copied {} compressed files for {}", copied, id);
        Ok(copied > 0)
    }
}

fn backend_error(e: anyhow::Error) -> CrashError {
    CrashError::Backend(format!("{:#}", e))
}

#[async_trait]
impl CrashBackendClient for SpoolBackend {
    fn is_enabled(&self, _device: &Device) -> bool {
        self.enabled
    }

    async fn start_minidump_processing(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<bool> {
        self.record_request(DumpKind::Minidump, window, cancel)
            .await
            .map_err(backend_error)
    }

    async fn start_coredump_processing(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<bool> {
        self.record_request(DumpKind::Coredump, window, cancel)
            .await
            .map_err(backend_error)
    }

    async fn fetch_minidumps(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        self.fetch_window(DumpKind::Minidump, window, cancel)
            .await
            .map_err(backend_error)
    }

    async fn fetch_coredumps(&self, window: &TimeWindow, cancel: &CancelToken) -> CrashResult<Vec<CrashRecord>> {
        self.fetch_window(DumpKind::Coredump, window, cancel)
            .await
            .map_err(backend_error)
    }

    async fn download(&self, kind: DumpKind, id: &str, dest: &Path, cancel: &CancelToken) -> CrashResult<bool> {
        self.copy_primary(kind, id, dest, cancel)
            .await
            .map_err(|e| CrashError::Download {
                kind,
                id: id.to_string(),
                reason: format!("{:#}", e),
            })
    }

    async fn download_compressed_companions(
        &self,
        kind: DumpKind,
        id: &str,
        dest: &Path,
        cancel: &CancelToken,
    ) -> CrashResult<bool> {
        self.copy_companions(kind, id, dest, cancel)
            .await
            .map_err(|e| CrashError::Download {
                kind,
                id: id.to_string(),
                reason: format!("{:#}", e),
            })
    }

    async fn is_file_known(&self, kind: DumpKind, filename: &str) -> CrashResult<bool> {
        Ok(self.lookup_by_filename(kind, filename).await?.is_some())
    }

    async fn lookup_by_filename(&self, kind: DumpKind, filename: &str) -> CrashResult<Option<CrashRecord>> {
        let records = self.records(kind).await.map_err(backend_error)?;
        Ok(records.into_iter().find(|record| record.filename == filename))
    }
}
