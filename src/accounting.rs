//! Append-only record of finished jobs.
//!
//! Each terminal job is written once, as one JSON object per line, and never
//! rewritten. The file is replayed into memory on open so status queries for
//! finished jobs survive a controller restart.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{Result, WlmError};
use crate::scheduler::{Job, JobState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub elapsed_secs: u64,
    pub cpu_seconds: u64,
    pub gpu_seconds: u64,
    pub memory_mb: u64,
}

impl ResourceUsage {
    pub fn for_job(job: &Job) -> Self {
        let elapsed_secs = job.elapsed_secs();
        Self {
            elapsed_secs,
            cpu_seconds: elapsed_secs.saturating_mul(u64::from(job.resources.cpus)),
            gpu_seconds: elapsed_secs.saturating_mul(u64::from(job.resources.gpus)),
            memory_mb: job.resources.memory_mb,
        }
    }

    fn accumulate(&mut self, other: &ResourceUsage) {
        self.elapsed_secs = self.elapsed_secs.saturating_add(other.elapsed_secs);
        self.cpu_seconds = self.cpu_seconds.saturating_add(other.cpu_seconds);
        self.gpu_seconds = self.gpu_seconds.saturating_add(other.gpu_seconds);
        self.memory_mb = self.memory_mb.max(other.memory_mb);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub usage: ResourceUsage,
    pub recorded_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: Job, recorded_at: DateTime<Utc>) -> Self {
        let usage = ResourceUsage::for_job(&job);
        Self {
            job,
            usage,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub owner: Option<String>,
    pub state: Option<JobState>,
    /// Most recent records only; all when unset.
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub struct AccountingStore {
    path: Option<PathBuf>,
    file: Option<File>,
    /// The file may end in a partial line, so the next record must start
    /// on a fresh one.
    torn: bool,
    records: Vec<JobRecord>,
    index: HashMap<Uuid, usize>,
}

impl AccountingStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            torn: false,
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Open (creating if needed) a JSON Lines store and load its records.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::in_memory();

        let mut needs_newline = false;
        if tokio::fs::try_exists(&path).await? {
            let text = tokio::fs::read_to_string(&path).await?;
            needs_newline = !text.is_empty() && !text.ends_with('\n');
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JobRecord>(line) {
                    Ok(record) => store.insert(record),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping unreadable accounting record"
                        );
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::info!(path = %path.display(), records = store.records.len(), "Accounting store opened");
        store.path = Some(path);
        store.file = Some(file);
        store.torn = needs_newline;
        Ok(store)
    }

    /// Open the configured file, or fall back to memory when none is set.
    pub async fn from_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::open(path).await,
            None => Ok(Self::in_memory()),
        }
    }

    fn insert(&mut self, record: JobRecord) {
        // On replay, a later line for the same job wins.
        if let Some(&pos) = self.index.get(&record.job.id) {
            self.records[pos] = record;
            return;
        }
        self.index.insert(record.job.id, self.records.len());
        self.records.push(record);
    }

    /// Durably append a record for a job in a terminal state.
    pub async fn append(&mut self, record: JobRecord) -> Result<()> {
        if !record.job.state.is_terminal() {
            return Err(WlmError::Internal(format!(
                "job {} is {} and cannot be archived",
                record.job.id, record.job.state
            )));
        }
        if self.index.contains_key(&record.job.id) {
            return Err(WlmError::DuplicateRecord(record.job.id));
        }

        if let Some(file) = self.file.as_mut() {
            let mut line = Vec::new();
            if self.torn {
                line.push(b'\n');
            }
            serde_json::to_writer(&mut line, &record)?;
            line.push(b'\n');
            // Until the write is known to be complete, assume it was cut
            // short. A blank line left behind is skipped on replay.
            self.torn = true;
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await?;
            self.torn = false;
        }

        tracing::info!(
            job_id = %record.job.id,
            state = %record.job.state,
            owner = %record.job.owner,
            elapsed_secs = record.usage.elapsed_secs,
            "Job archived"
        );
        self.insert(record);
        Ok(())
    }

    pub fn get(&self, job_id: &Uuid) -> Option<&JobRecord> {
        self.index.get(job_id).map(|&pos| &self.records[pos])
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.index.contains_key(job_id)
    }

    /// Records in append order.
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Matching records in append order, keeping only the newest `limit`.
    pub fn query(&self, filter: &RecordFilter) -> Vec<&JobRecord> {
        let matching: Vec<&JobRecord> = self
            .records
            .iter()
            .filter(|r| filter.owner.as_deref().map_or(true, |o| r.job.owner == o))
            .filter(|r| filter.state.map_or(true, |s| r.job.state == s))
            .collect();
        match filter.limit {
            Some(limit) if matching.len() > limit => matching[matching.len() - limit..].to_vec(),
            _ => matching,
        }
    }

    /// Total usage per job owner.
    pub fn usage_by_owner(&self) -> BTreeMap<String, ResourceUsage> {
        let mut totals: BTreeMap<String, ResourceUsage> = BTreeMap::new();
        for record in &self.records {
            totals
                .entry(record.job.owner.clone())
                .or_default()
                .accumulate(&record.usage);
        }
        totals
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
