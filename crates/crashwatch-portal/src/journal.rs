//! Append-only NDJSON journals standing in for the ticket tracker and the
//! step report writer.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crashwatch_core::{CrashError, CrashResult, StepReporter, StepResult, TicketRequest, TicketSink};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::info;

pub const TICKET_ID_PREFIX: &str = "CRASH-";

/// Every append is flushed, so dropping a writer loses nothing.
pub struct JournalWriter {
    writer: Option<BufWriter<tokio::fs::File>>,
    path: PathBuf,
    lines: u64,
}

impl JournalWriter {
    /// Open `path` for appending, creating it (and its parent) if needed.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let lines = count_lines(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {:?}", path))?;

        Ok(Self {
            writer: Some(BufWriter::new(tokio::fs::File::from_std(file))),
            path,
            lines,
        })
    }

    pub async fn append<T: Serialize>(&mut self, entry: &T) -> anyhow::Result<u64> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Journal {:?} is closed", self.path))?;
        let mut json = serde_json::to_string(entry)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
        self.lines += 1;
        Ok(self.lines)
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }
}

fn count_lines(path: &Path) -> anyhow::Result<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read journal {:?}", path)),
    };
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTicket {
    pub ts: DateTime<Utc>,
    pub id: String,
    pub ticket: TicketRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedStep {
    pub ts: DateTime<Utc>,
    pub step: StepResult,
}

/// Ticket sink that journals each request and numbers it `CRASH-<n>`.
pub struct TicketJournal {
    journal: Mutex<JournalWriter>,
}

impl TicketJournal {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        Ok(Self {
            journal: Mutex::new(JournalWriter::open(path)?),
        })
    }
}

#[async_trait]
impl TicketSink for TicketJournal {
    async fn create_ticket(&self, request: &TicketRequest) -> CrashResult<String> {
        let mut journal = self.journal.lock().await;
        let id = format!("{}{}", TICKET_ID_PREFIX, journal.lines() + 1);
        let entry = RecordedTicket {
            ts: Utc::now(),
            id: id.clone(),
            ticket: request.clone(),
        };
        journal
            .append(&entry)
            .await
            .map_err(|e| CrashError::Ticketing(format!("{:#}", e)))?;
        info!("Journaled ticket {} to {:?}", id, journal.path());
        Ok(id)
    }
}

pub struct StepJournal {
    journal: Mutex<JournalWriter>,
}

impl StepJournal {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        Ok(Self {
            journal: Mutex::new(JournalWriter::open(path)?),
        })
    }
}

#[async_trait]
impl StepReporter for StepJournal {
    async fn report_step(&self, result: &StepResult) -> CrashResult<()> {
        let entry = RecordedStep {
            ts: Utc::now(),
            step: result.clone(),
        };
        self.journal
            .lock()
            .await
            .append(&entry)
            .await
            .map_err(|e| CrashError::Reporter(format!("{:#}", e)))?;
        Ok(())
    }
}
