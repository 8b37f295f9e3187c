//! Ingestion job tracking.
//!
//! The tracker is a keyed map owned by the service instance, not a process global, so it
//! can be constructed fresh per test and cleared on reset. Every mutation is tagged with
//! the job identifier it belongs to; updates from a superseded job are discarded, which is
//! what lets a reset interrupt a stale background task without racing its late progress
//! writes.

use crate::ingest::types::IngestionSummary;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Lifecycle states of an ingestion job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, background processing not started yet.
    Queued,
    /// Pipeline is working through the document elements.
    Processing,
    /// All elements handled; summary available.
    Completed,
    /// Document-level failure; message carries the cause.
    Error,
}

/// Capability to report progress for one specific job.
///
/// Holding a ticket does not guarantee the job is still active; stale tickets are ignored.
#[derive(Clone, Debug)]
pub struct JobTicket {
    pub(crate) document: String,
    pub(crate) job_id: Uuid,
}

#[derive(Clone, Debug)]
struct JobRecord {
    job_id: Uuid,
    status: JobStatus,
    message: String,
    current: usize,
    total: usize,
    summary: Option<IngestionSummary>,
}

/// Snapshot of a job exposed to polling clients.
#[derive(Clone, Debug, serde::Serialize)]
pub struct IngestionStatusView {
    /// Lifecycle state.
    pub status: JobStatus,
    /// Human-readable phase message.
    pub message: String,
    /// Elements handled so far.
    pub current: usize,
    /// Total elements discovered for the document.
    pub total: usize,
    /// Percentage derived from `current`/`total`; 100 on completion.
    pub progress: u8,
    /// Final counters, present once the job completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<IngestionSummary>,
}

/// Process-wide ingestion status map keyed by document identifier.
#[derive(Default)]
pub struct StatusTracker {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl StatusTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new queued job for `document`, superseding any previous job.
    pub fn begin(&self, document: &str) -> JobTicket {
        let job_id = Uuid::new_v4();
        let record = JobRecord {
            job_id,
            status: JobStatus::Queued,
            message: "Queued for processing".to_string(),
            current: 0,
            total: 0,
            summary: None,
        };
        self.jobs
            .lock()
            .expect("status lock poisoned")
            .insert(document.to_string(), record);
        JobTicket {
            document: document.to_string(),
            job_id,
        }
    }

    /// Record progress for the ticket's job. Returns `false` when the ticket is stale.
    pub fn update(&self, ticket: &JobTicket, message: &str, current: usize, total: usize) -> bool {
        self.mutate(ticket, |record| {
            record.status = JobStatus::Processing;
            record.message = message.to_string();
            record.current = current;
            record.total = total;
        })
    }

    /// Mark the ticket's job completed with its final summary.
    pub fn complete(&self, ticket: &JobTicket, summary: IngestionSummary) -> bool {
        self.mutate(ticket, |record| {
            record.status = JobStatus::Completed;
            record.message = "Ingestion complete".to_string();
            record.current = record.total;
            record.summary = Some(summary);
        })
    }

    /// Mark the ticket's job failed with a descriptive message.
    pub fn fail(&self, ticket: &JobTicket, message: &str) -> bool {
        self.mutate(ticket, |record| {
            record.status = JobStatus::Error;
            record.message = message.to_string();
        })
    }

    /// Whether the ticket still identifies the active job for its document.
    ///
    /// Goes false once the job is superseded by a reset or a newer upload; the pipeline
    /// polls this before index writes so a stale job stops mutating the corpus.
    pub fn is_active(&self, ticket: &JobTicket) -> bool {
        let jobs = self.jobs.lock().expect("status lock poisoned");
        jobs.get(&ticket.document)
            .is_some_and(|record| record.job_id == ticket.job_id)
    }

    /// Snapshot the job registered for `document`, if any.
    pub fn get(&self, document: &str) -> Option<IngestionStatusView> {
        let jobs = self.jobs.lock().expect("status lock poisoned");
        jobs.get(document).map(|record| IngestionStatusView {
            status: record.status,
            message: record.message.clone(),
            current: record.current,
            total: record.total,
            progress: progress_percent(record),
            summary: record.summary,
        })
    }

    /// Drop every job; called on reset.
    pub fn clear(&self) {
        self.jobs.lock().expect("status lock poisoned").clear();
    }

    fn mutate<F>(&self, ticket: &JobTicket, apply: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.lock().expect("status lock poisoned");
        match jobs.get_mut(&ticket.document) {
            Some(record) if record.job_id == ticket.job_id => {
                apply(record);
                true
            }
            _ => {
                tracing::debug!(
                    document = %ticket.document,
                    "Discarding progress update for superseded job"
                );
                false
            }
        }
    }
}

fn progress_percent(record: &JobRecord) -> u8 {
    match record.status {
        JobStatus::Completed => 100,
        JobStatus::Queued => 0,
        _ if record.total == 0 => 0,
        _ => ((record.current * 100) / record.total).min(99) as u8,
    }
}
