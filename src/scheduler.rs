//! Scheduler: worker slot allocation and maintenance loops.
//!
//! A bounded pool of worker tasks drains the job queue; each worker claims
//! one approved job at a time and drives it to a terminal state. A
//! maintenance loop periodically expires overdue `awaiting_approval` jobs
//! and deletes unprotected terminal jobs past retention. On startup, jobs a
//! dead worker left `running` are reset to `approved` so they get picked up
//! again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::Core;
use crate::error::KgResult;
use crate::ingest;

/// Idle-worker poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Recover stale jobs and start the worker pool plus the sweep loop.
    pub async fn start(core: Arc<Core>) -> KgResult<Self> {
        let recovered = core.jobs.recover_stale_running().await?;
        if recovered > 0 {
            tracing::info!(recovered, "reset stale running jobs to approved");
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for worker_id in 0..core.config.jobs.workers {
            let core = Arc::clone(&core);
            let shutdown = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                worker_loop(core, shutdown, worker_id).await;
            }));
        }

        {
            let core = Arc::clone(&core);
            let shutdown = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                sweep_loop(core, shutdown).await;
            }));
        }

        Ok(Self { shutdown, handles })
    }

    /// Signal shutdown and wait for workers to finish their current step.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(core: Arc<Core>, shutdown: Arc<AtomicBool>, worker_id: usize) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match core.jobs.claim_next().await {
            Ok(Some(job)) => {
                tracing::info!(worker_id, job_id = %job.id, job_type = %job.job_type, "job started");
                ingest::run_job(&core, &job).await;
                tracing::info!(worker_id, job_id = %job.id, "job finished");
            }
            Ok(None) => {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "claim failed");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

async fn sweep_loop(core: Arc<Core>, shutdown: Arc<AtomicBool>) {
    let interval = Duration::from_secs(core.config.jobs.sweep_interval_secs.max(1));
    loop {
        // Sleep in short slices so shutdown stays responsive.
        let mut remaining = interval;
        while remaining > Duration::ZERO {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let step = remaining.min(Duration::from_millis(250));
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        if let Err(e) = sweep_once(&core).await {
            tracing::error!(error = %e, "sweep failed");
        }
    }
}

/// One maintenance pass: expiration, retention, vocabulary zone check.
pub async fn sweep_once(core: &Core) -> KgResult<()> {
    let expired = core.jobs.expire_pending().await?;
    if expired > 0 {
        tracing::info!(expired, "expired unapproved jobs");
    }
    let deleted = core
        .jobs
        .sweep_retention(core.config.jobs.retention_days)
        .await?;
    if deleted > 0 {
        tracing::info!(deleted, "deleted jobs past retention");
    }

    let zone = core.vocabulary.zone().await;
    match zone {
        crate::vocabulary::Zone::TooLarge | crate::vocabulary::Zone::Critical => {
            tracing::warn!(zone = zone.as_str(), "vocabulary needs consolidation");
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::test_core;
    use crate::ingest::{IngestContent, IngestRequest};
    use crate::models::JobStatus;

    #[tokio::test]
    async fn worker_pool_drains_the_queue() {
        let (_tmp, core) = test_core().await;
        let scheduler = Scheduler::start(Arc::clone(&core)).await.unwrap();

        let job = ingest::submit(
            &core,
            "tester",
            IngestRequest {
                ontology: "Philosophy".into(),
                filename: "lecture.md".into(),
                content: IngestContent::Text(
                    "Meditation dissolves the Ego. Nirvana follows Meditation.".into(),
                ),
                force_reingest: false,
                auto_approve: true,
                target_words: None,
                overlap_words: None,
            },
        )
        .await
        .unwrap();

        let mut status = job.status;
        for _ in 0..100 {
            status = core.jobs.get(&job.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        scheduler.stop().await;

        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unapproved_jobs_are_not_picked_up() {
        let (_tmp, core) = test_core().await;
        let scheduler = Scheduler::start(Arc::clone(&core)).await.unwrap();

        let job = ingest::submit(
            &core,
            "tester",
            IngestRequest {
                ontology: "Philosophy".into(),
                filename: "waiting.md".into(),
                content: IngestContent::Text("Patience is a Virtue.".into()),
                force_reingest: false,
                auto_approve: false,
                target_words: None,
                overlap_words: None,
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let still = core.jobs.get(&job.id).await.unwrap();
        scheduler.stop().await;

        assert_eq!(still.status, JobStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn sweep_expires_overdue_jobs() {
        let (_tmp, core) = test_core().await;
        let job = ingest::submit(
            &core,
            "tester",
            IngestRequest {
                ontology: "Philosophy".into(),
                filename: "old.md".into(),
                content: IngestContent::Text("Forgotten Wisdom never approved.".into()),
                force_reingest: false,
                auto_approve: false,
                target_words: None,
                overlap_words: None,
            },
        )
        .await
        .unwrap();

        sqlx::query("UPDATE jobs SET expires_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp() - 5)
            .bind(&job.id)
            .execute(core.graph.pool())
            .await
            .unwrap();

        sweep_once(&core).await.unwrap();
        assert_eq!(
            core.jobs.get(&job.id).await.unwrap().status,
            JobStatus::Expired
        );
    }
}
