use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::job::{JobSnapshot, JobStatus};
use crate::providers::ProviderKind;

const LOG_STEM: &str = "telemetry-buffer";

/// One line of the job log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobSubmitted {
        job_id: String,
        total_count: usize,
    },
    ProviderRateLimited {
        provider: &'static str,
        attempt: u32,
    },
    JobFinished {
        job_id: String,
        status: JobStatus,
        total_count: usize,
        processed_count: usize,
        succeeded_count: usize,
        error_count: usize,
        failure: Option<String>,
    },
}

impl JobEvent {
    fn closes_job(&self) -> bool {
        matches!(self, JobEvent::JobFinished { .. })
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a JobEvent,
}

/// JSON-lines log of job lifecycle events. Events queue in memory until
/// the batch fills or a job finishes; a failed write keeps them queued for
/// the next flush. Old logs roll over to `telemetry-buffer.<n>.jsonl`.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: bool,
    pending: Arc<Mutex<Vec<(DateTime<Utc>, JobEvent)>>>,
    log_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_files: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            enabled: config.telemetry_enabled_by_default,
            pending: Arc::new(Mutex::new(Vec::new())),
            log_path: data_dir.join(format!("{LOG_STEM}.jsonl")),
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_files: config.telemetry_buffer_max_files,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn job_submitted(&self, job_id: &str, total_count: usize) {
        self.emit(JobEvent::JobSubmitted {
            job_id: job_id.to_string(),
            total_count,
        });
    }

    pub fn provider_rate_limited(&self, provider: ProviderKind, attempt: u32) {
        self.emit(JobEvent::ProviderRateLimited {
            provider: provider.as_str(),
            attempt,
        });
    }

    pub fn job_finished(&self, snapshot: &JobSnapshot) {
        self.emit(JobEvent::JobFinished {
            job_id: snapshot.job_id.clone(),
            status: snapshot.status,
            total_count: snapshot.total_count,
            processed_count: snapshot.processed_count,
            succeeded_count: snapshot.succeeded_count,
            error_count: snapshot.errors.len(),
            failure: snapshot.failure.clone(),
        });
    }

    pub fn emit(&self, event: JobEvent) {
        if !self.enabled {
            return;
        }
        let mut pending = self.pending.lock();
        let closes_job = event.closes_job();
        pending.push((Utc::now(), event));
        if closes_job || pending.len() >= self.batch_size {
            if let Err(err) = self.write_pending(&mut pending) {
                warn!(?err, queued = pending.len(), "telemetry write failed; keeping events queued");
            }
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.write_pending(&mut pending)
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.pending.lock().len()
    }

    fn write_pending(&self, pending: &mut Vec<(DateTime<Utc>, JobEvent)>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        for (timestamp, event) in pending.iter() {
            serde_json::to_writer(
                &mut lines,
                &LogLine {
                    timestamp: *timestamp,
                    event,
                },
            )?;
            lines.push(b'\n');
        }

        self.roll_over_if_full(lines.len() as u64)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&lines)?;
        writer.flush()?;

        debug!(events = pending.len(), "telemetry flushed");
        pending.clear();
        Ok(())
    }

    fn roll_over_if_full(&self, incoming: u64) -> AppResult<()> {
        let current = match fs::metadata(&self.log_path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok(()),
        };
        if current == 0 || current + incoming <= self.max_file_bytes {
            return Ok(());
        }

        let generations = self.max_files.saturating_sub(1);
        if generations == 0 {
            File::create(&self.log_path)?;
            return Ok(());
        }
        let oldest = self.generation_path(generations);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..generations).rev() {
            let from = self.generation_path(n);
            if from.exists() {
                fs::rename(&from, self.generation_path(n + 1))?;
            }
        }
        fs::rename(&self.log_path, self.generation_path(1))?;
        Ok(())
    }

    fn generation_path(&self, n: usize) -> PathBuf {
        self.log_path.with_file_name(format!("{LOG_STEM}.{n}.jsonl"))
    }
}
