//! Persisted job queue with an approval-gated state machine.
//!
//! Every mutation of graph state passes through here as an asynchronous
//! job. Submission places a job in `awaiting_approval` (or directly in
//! `approved` when auto-approve is set) with a pre-flight cost estimate and
//! an expiry deadline; workers claim approved jobs atomically; cancellation
//! is a cooperative flag the worker observes between chunks. Terminal
//! records are kept until the retention sweep deletes them, unless marked
//! protected.
//!
//! ```text
//!   submitted → awaiting_approval → approved → running ─┬→ completed
//!                 ↓ expired              ↓ cancel       ├→ failed
//!               cancelled            cancelled          └→ cancelled
//! ```

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{KgError, KgResult};
use crate::models::{CostEstimate, Job, JobProgress, JobStatus};

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Submit a new job. Auto-approve skips the approval gate; otherwise
    /// the job waits with an expiry deadline.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        job_type: &str,
        principal: &str,
        ontology: &str,
        params: serde_json::Value,
        cost_estimate: Option<CostEstimate>,
        auto_approve: bool,
        pending_deadline_hours: i64,
    ) -> KgResult<Job> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let (status, approved_at, expires_at) = if auto_approve {
            (JobStatus::Approved, Some(now), None)
        } else {
            (
                JobStatus::AwaitingApproval,
                None,
                Some(now + chrono::Duration::hours(pending_deadline_hours)),
            )
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, principal, ontology, params_json, cost_estimate_json, progress_json, errors_json, protected, cancel_requested, created_at, approved_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, '[]', 0, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_type)
        .bind(status.as_str())
        .bind(principal)
        .bind(ontology)
        .bind(serde_json::to_string(&params)?)
        .bind(
            cost_estimate
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&JobProgress::default())?)
        .bind(now.timestamp())
        .bind(approved_at.map(|t| t.timestamp()))
        .bind(expires_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> KgResult<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row)
            .transpose()?
            .ok_or_else(|| KgError::NotFound(format!("job {}", id)))
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        ontology: Option<&str>,
        limit: i64,
    ) -> KgResult<Vec<Job>> {
        let rows = match (status, ontology) {
            (Some(s), Some(o)) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE status = ? AND ontology = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(s.as_str())
                .bind(o)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(s), None) => {
                sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(s.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(o)) => {
                sqlx::query("SELECT * FROM jobs WHERE ontology = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(o)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(job_from_row).collect()
    }

    /// Approve a pending job. Only `awaiting_approval` jobs can be approved.
    pub async fn approve(&self, id: &str) -> KgResult<Job> {
        let job = self.get(id).await?;
        if job.status != JobStatus::AwaitingApproval {
            return Err(KgError::Conflict(format!(
                "job {} is {}, not awaiting approval",
                id,
                job.status.as_str()
            )));
        }
        sqlx::query(
            "UPDATE jobs SET status = ?, approved_at = ?, expires_at = NULL WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Approved.as_str())
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(JobStatus::AwaitingApproval.as_str())
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    /// Request cancellation. Pre-running jobs transition immediately;
    /// running jobs get the cooperative flag and transition at the next
    /// chunk boundary.
    pub async fn cancel(&self, id: &str) -> KgResult<Job> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Submitted | JobStatus::AwaitingApproval | JobStatus::Approved => {
                sqlx::query("UPDATE jobs SET status = ?, finished_at = ? WHERE id = ?")
                    .bind(JobStatus::Cancelled.as_str())
                    .bind(Utc::now().timestamp())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            JobStatus::Running => {
                sqlx::query("UPDATE jobs SET cancel_requested = 1 WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            terminal => {
                return Err(KgError::Conflict(format!(
                    "job {} is already {}",
                    id,
                    terminal.as_str()
                )));
            }
        }
        self.get(id).await
    }

    /// Delete a terminal job record.
    pub async fn delete(&self, id: &str) -> KgResult<()> {
        let job = self.get(id).await?;
        if !job.status.is_terminal() {
            return Err(KgError::Conflict(format!(
                "job {} is {}; only terminal jobs can be deleted",
                id,
                job.status.as_str()
            )));
        }
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Find a non-terminal job already targeting a document, so duplicate
    /// submissions are rejected before the first job has even run.
    pub async fn find_active_for_document(&self, document_id: &str) -> KgResult<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE json_extract(params_json, '$.document_id') = ?
              AND status IN (?, ?, ?, ?)
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .bind(JobStatus::Submitted.as_str())
        .bind(JobStatus::AwaitingApproval.as_str())
        .bind(JobStatus::Approved.as_str())
        .bind(JobStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically claim the oldest approved job for a worker, moving it to
    /// `running`. Returns `None` when the queue is drained.
    pub async fn claim_next(&self) -> KgResult<Option<Job>> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET status = ?, started_at = ?
            WHERE id = (SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC LIMIT 1)
            RETURNING id
            "#,
        )
        .bind(JobStatus::Running.as_str())
        .bind(Utc::now().timestamp())
        .bind(JobStatus::Approved.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(id) => Ok(Some(self.get(&id).await?)),
            None => Ok(None),
        }
    }

    /// Cooperative cancellation check, read between chunks.
    pub async fn is_cancel_requested(&self, id: &str) -> KgResult<bool> {
        let flag: Option<i64> = sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub async fn update_progress(
        &self,
        id: &str,
        progress: &JobProgress,
        errors: &[String],
    ) -> KgResult<()> {
        sqlx::query("UPDATE jobs SET progress_json = ?, errors_json = ? WHERE id = ?")
            .bind(serde_json::to_string(progress)?)
            .bind(serde_json::to_string(errors)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a running job to a terminal state with its final counters.
    pub async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        progress: &JobProgress,
        errors: &[String],
        result: Option<serde_json::Value>,
    ) -> KgResult<()> {
        if !status.is_terminal() {
            return Err(KgError::Internal(format!(
                "finish called with non-terminal status {}",
                status.as_str()
            )));
        }
        sqlx::query(
            "UPDATE jobs SET status = ?, progress_json = ?, errors_json = ?, result_json = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(progress)?)
        .bind(serde_json::to_string(errors)?)
        .bind(result.map(|r| r.to_string()))
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_protected(&self, id: &str, protected: bool) -> KgResult<()> {
        sqlx::query("UPDATE jobs SET protected = ? WHERE id = ?")
            .bind(protected as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sweep: expire `awaiting_approval` jobs past their deadline.
    pub async fn expire_pending(&self) -> KgResult<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, finished_at = ? WHERE status = ? AND expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(JobStatus::Expired.as_str())
        .bind(Utc::now().timestamp())
        .bind(JobStatus::AwaitingApproval.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Sweep: delete unprotected terminal jobs older than the retention
    /// window.
    pub async fn sweep_retention(&self, retention_days: i64) -> KgResult<u64> {
        let cutoff = Utc::now().timestamp() - retention_days * 86_400;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE protected = 0 AND finished_at IS NOT NULL AND finished_at < ? AND status IN (?, ?, ?, ?)",
        )
        .bind(cutoff)
        .bind(JobStatus::Completed.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(JobStatus::Cancelled.as_str())
        .bind(JobStatus::Expired.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Startup recovery: jobs left `running` by a dead worker go back to
    /// `approved` so the next worker picks them up.
    pub async fn recover_stale_running(&self) -> KgResult<u64> {
        let result = sqlx::query("UPDATE jobs SET status = ?, started_at = NULL WHERE status = ?")
            .bind(JobStatus::Approved.as_str())
            .bind(JobStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> KgResult<Job> {
    let status_str: String = row.get("status");
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| KgError::Internal(format!("unknown job status '{}'", status_str)))?;

    let ts = |v: Option<i64>| -> Option<DateTime<Utc>> {
        v.and_then(|t| Utc.timestamp_opt(t, 0).single())
    };

    Ok(Job {
        id: row.get("id"),
        job_type: row.get("job_type"),
        status,
        principal: row.get("principal"),
        ontology: row.get("ontology"),
        params: serde_json::from_str(&row.get::<String, _>("params_json"))?,
        cost_estimate: row
            .get::<Option<String>, _>("cost_estimate_json")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        progress: serde_json::from_str(&row.get::<String, _>("progress_json"))?,
        errors: serde_json::from_str(&row.get::<String, _>("errors_json"))?,
        result: row
            .get::<Option<String>, _>("result_json")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        protected: row.get::<i64, _>("protected") != 0,
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: ts(Some(row.get("created_at"))).unwrap_or_else(Utc::now),
        approved_at: ts(row.get("approved_at")),
        started_at: ts(row.get("started_at")),
        finished_at: ts(row.get("finished_at")),
        expires_at: ts(row.get("expires_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_queue() -> (tempfile::TempDir, JobQueue) {
        let tmp = tempfile::tempdir().unwrap();
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(tmp.path().join("jobs.sqlite"))
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, JobQueue::new(pool))
    }

    async fn submit(queue: &JobQueue, auto_approve: bool) -> Job {
        queue
            .submit(
                "ingest_text",
                "tester",
                "Philosophy",
                serde_json::json!({"filename": "x.md"}),
                None,
                auto_approve,
                24,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submission_awaits_approval_by_default() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, false).await;
        assert_eq!(job.status, JobStatus::AwaitingApproval);
        assert!(job.expires_at.is_some());
    }

    #[tokio::test]
    async fn auto_approve_skips_the_gate() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, true).await;
        assert_eq!(job.status, JobStatus::Approved);
        assert!(job.approved_at.is_some());
        assert!(job.expires_at.is_none());
    }

    #[tokio::test]
    async fn approve_then_claim() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, false).await;
        let approved = queue.approve(&job.id).await.unwrap();
        assert_eq!(approved.status, JobStatus::Approved);

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approve_rejects_wrong_state() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, true).await;
        let err = queue.approve(&job.id).await.unwrap_err();
        assert!(matches!(err, KgError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_before_running_is_immediate() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, false).await;
        let cancelled = queue.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_running_sets_cooperative_flag() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, true).await;
        queue.claim_next().await.unwrap().unwrap();

        let cancelled = queue.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Running);
        assert!(queue.is_cancel_requested(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_requires_terminal_state() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, true).await;
        assert!(queue.delete(&job.id).await.is_err());

        queue.claim_next().await.unwrap();
        queue
            .finish(
                &job.id,
                JobStatus::Completed,
                &JobProgress::default(),
                &[],
                None,
            )
            .await
            .unwrap();
        queue.delete(&job.id).await.unwrap();
        assert!(queue.get(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn expire_sweep_only_touches_overdue_jobs() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, false).await;

        // Deadline in the future: nothing expires.
        assert_eq!(queue.expire_pending().await.unwrap(), 0);

        // Force the deadline into the past.
        sqlx::query("UPDATE jobs SET expires_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp() - 10)
            .bind(&job.id)
            .execute(&queue.pool)
            .await
            .unwrap();
        assert_eq!(queue.expire_pending().await.unwrap(), 1);
        assert_eq!(queue.get(&job.id).await.unwrap().status, JobStatus::Expired);
    }

    #[tokio::test]
    async fn retention_sweep_spares_protected_jobs() {
        let (_tmp, queue) = test_queue().await;
        let old = submit(&queue, true).await;
        let kept = submit(&queue, true).await;

        for id in [&old.id, &kept.id] {
            queue.claim_next().await.unwrap();
            queue
                .finish(id, JobStatus::Completed, &JobProgress::default(), &[], None)
                .await
                .unwrap();
            sqlx::query("UPDATE jobs SET finished_at = ? WHERE id = ?")
                .bind(Utc::now().timestamp() - 40 * 86_400)
                .bind(id)
                .execute(&queue.pool)
                .await
                .unwrap();
        }
        queue.set_protected(&kept.id, true).await.unwrap();

        assert_eq!(queue.sweep_retention(30).await.unwrap(), 1);
        assert!(queue.get(&old.id).await.is_err());
        assert!(queue.get(&kept.id).await.is_ok());
    }

    #[tokio::test]
    async fn stale_running_recovers_to_approved() {
        let (_tmp, queue) = test_queue().await;
        let job = submit(&queue, true).await;
        queue.claim_next().await.unwrap();

        assert_eq!(queue.recover_stale_running().await.unwrap(), 1);
        assert_eq!(queue.get(&job.id).await.unwrap().status, JobStatus::Approved);
    }
}
