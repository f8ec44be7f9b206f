//! Job queue: strict priority bands with FIFO order inside a band.
//!
//! The durable implementation keeps jobs in the same SQLite database as the
//! products they refresh, so queued work survives a restart. Claiming is a
//! single UPDATE over a subselect, which is atomic under SQLite's writer
//! lock even with several workers polling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::model::{JobKind, ScrapeJob};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend failure: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("corrupt job row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: ScrapeJob) -> Result<(), QueueError>;
    /// Claim the highest-priority available job, oldest first within a
    /// band, and mark it running. Returns `None` when nothing is available.
    async fn claim_next(&self) -> Result<Option<ScrapeJob>, QueueError>;
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError>;
    /// Put a job back with an incremented attempt counter, invisible until
    /// the backoff delay elapses.
    async fn retry_later(&self, job: &ScrapeJob, delay: Duration, error: &str) -> Result<(), QueueError>;
    /// Number of jobs still waiting to run.
    async fn depth(&self) -> Result<u64, QueueError>;
}

#[derive(Debug, Clone)]
pub struct DurableJobQueue {
    pool: SqlitePool,
}

type JobRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
    DateTime<Utc>,
);

fn job_from_row(row: JobRow) -> Result<ScrapeJob, QueueError> {
    let (id, kind, query, site, product_id, priority, attempt, enqueued_at) = row;
    let parsed_id = Uuid::parse_str(&id).map_err(|e| QueueError::Corrupt {
        id: id.clone(),
        reason: e.to_string(),
    })?;
    let kind = JobKind::parse(&kind).ok_or_else(|| QueueError::Corrupt {
        id: id.clone(),
        reason: format!("unknown job kind {kind}"),
    })?;
    Ok(ScrapeJob {
        id: parsed_id,
        kind,
        query,
        site,
        product_id,
        priority,
        attempt: attempt.max(0) as u32,
        enqueued_at,
    })
}

impl DurableJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return jobs left `running` by a crashed worker to the queue once
    /// they exceed the visibility timeout.
    pub async fn requeue_stuck(&self, visibility: Duration) -> Result<u64, QueueError> {
        let horizon =
            Utc::now() - chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::zero());
        let result = sqlx::query(
            "UPDATE scrape_jobs SET status = 'queued', started_at = NULL \
             WHERE status = 'running' AND started_at < $1",
        )
        .bind(horizon)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobQueue for DurableJobQueue {
    async fn enqueue(&self, job: ScrapeJob) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO scrape_jobs \
                (id, kind, query, site, product_id, priority, attempt, status, enqueued_at, available_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', $8, $8)",
        )
        .bind(job.id.to_string())
        .bind(job.kind.as_str())
        .bind(&job.query)
        .bind(&job.site)
        .bind(&job.product_id)
        .bind(job.priority)
        .bind(job.attempt as i64)
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ScrapeJob>, QueueError> {
        let now = Utc::now();
        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE scrape_jobs SET status = 'running', started_at = $1 \
             WHERE id = (\
                SELECT id FROM scrape_jobs \
                WHERE status = 'queued' AND available_at <= $1 \
                ORDER BY priority DESC, enqueued_at ASC, id ASC \
                LIMIT 1) \
             RETURNING id, kind, query, site, product_id, priority, attempt, enqueued_at",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(job_from_row).transpose()
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'done', finished_at = $1 WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE scrape_jobs SET status = 'failed', finished_at = $1, last_error = $2 \
             WHERE id = $3",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_later(&self, job: &ScrapeJob, delay: Duration, error: &str) -> Result<(), QueueError> {
        let available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        sqlx::query(
            "UPDATE scrape_jobs SET \
                status = 'queued', attempt = attempt + 1, available_at = $1, \
                started_at = NULL, last_error = $2 \
             WHERE id = $3",
        )
        .bind(available_at)
        .bind(error)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let (depth,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scrape_jobs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(depth.max(0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryStatus {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug)]
struct MemoryEntry {
    job: ScrapeJob,
    status: MemoryStatus,
    available_at: DateTime<Utc>,
    seq: u64,
}

/// In-process queue with the same ordering semantics as the durable one.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    entries: HashMap<Uuid, MemoryEntry>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: ScrapeJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        let available_at = job.enqueued_at;
        state.entries.insert(
            job.id,
            MemoryEntry {
                job,
                status: MemoryStatus::Queued,
                available_at,
                seq,
            },
        );
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ScrapeJob>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let candidate = state
            .entries
            .values()
            .filter(|e| e.status == MemoryStatus::Queued && e.available_at <= now)
            .max_by_key(|e| (e.job.priority, std::cmp::Reverse(e.seq)))
            .map(|e| e.job.id);
        if let Some(id) = candidate {
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| QueueError::Corrupt {
                    id: id.to_string(),
                    reason: "claimed entry vanished".to_string(),
                })?;
            entry.status = MemoryStatus::Running;
            return Ok(Some(entry.job.clone()));
        }
        Ok(None)
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.status = MemoryStatus::Done;
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, _error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.status = MemoryStatus::Failed;
        }
        Ok(())
    }

    async fn retry_later(&self, job: &ScrapeJob, delay: Duration, _error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&job.id) {
            entry.status = MemoryStatus::Queued;
            entry.job.attempt += 1;
            entry.available_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.status == MemoryStatus::Queued)
            .count() as u64)
    }
}
