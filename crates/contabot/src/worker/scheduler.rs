//! Periodic single-flight drain of the job queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};

use super::error::{JobStoreError, WorkerError};
use super::job::Job;
use super::pipeline::JobPipeline;
use crate::db::{job_repo, Database};
use crate::messages;
use crate::notifier::Notifier;

/// Delay before a failed job becomes eligible again.
///
/// A zero base retries on the next poll. Otherwise the delay doubles per
/// attempt: `base * 2^(attempts - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub const IMMEDIATE: RetryBackoff = RetryBackoff {
        base: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn delay(&self, attempts: u32) -> Option<Duration> {
        if self.base.is_zero() {
            return None;
        }
        let exponent = attempts.saturating_sub(1).min(20);
        Some(self.base.saturating_mul(1u32 << exponent).min(self.max))
    }

    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(self.delay(attempts)?).ok()?;
        now.checked_add_signed(delay)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub batch_size: usize,
    /// Jobs left `processing` longer than this are put back to `pending`.
    pub stale_after: Duration,
    pub backoff: RetryBackoff,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 10,
            stale_after: Duration::from_secs(600),
            backoff: RetryBackoff::IMMEDIATE,
        }
    }
}

/// Counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// The previous cycle was still running; nothing was done.
    pub skipped: bool,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

enum JobOutcome {
    Completed,
    Retried,
    Failed,
}

/// Resets the running flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct WorkerLoop {
    db: Database,
    pipeline: JobPipeline,
    notifier: Notifier,
    settings: WorkerSettings,
    running: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
}

impl WorkerLoop {
    pub fn new(
        db: Database,
        pipeline: JobPipeline,
        notifier: Notifier,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            db,
            pipeline,
            notifier,
            settings,
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Puts jobs a previous process left `processing` back to `pending`.
    /// Call once before the first cycle.
    pub fn recover(&self) -> Result<usize, WorkerError> {
        let requeued = job_repo::requeue_stale(&self.db, Utc::now())?;
        if requeued > 0 {
            warn!(requeued, "Requeued jobs left processing by a previous run");
        }
        Ok(requeued)
    }

    /// Runs until [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.settings.interval.as_secs_f64(),
            batch_size = self.settings.batch_size,
            "Worker loop started"
        );
        if let Err(e) = self.recover() {
            error!("Failed to recover stale jobs: {}", e);
        }

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = self.wake.notified() => {},
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if report.claimed > 0 => info!(
                    claimed = report.claimed,
                    completed = report.completed,
                    retried = report.retried,
                    failed = report.failed,
                    "Worker cycle finished"
                ),
                Ok(_) => {}
                Err(e) => error!("Worker cycle aborted: {}", e),
            }
        }

        info!("Worker loop stopped");
    }

    /// Requests an immediate cycle.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn is_running_cycle(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn try_begin_cycle(&self) -> Option<CycleGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(&self.running))
    }

    /// Claims one batch and processes it in FIFO order. Skipped if a cycle
    /// is already in progress.
    ///
    /// A job store error aborts the rest of the batch. The job that hit it
    /// and every job after it go back to `pending` without spending an
    /// attempt.
    pub async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        let Some(_guard) = self.try_begin_cycle() else {
            info!("Previous cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        };

        self.drain_batch()
            .instrument(info_span!("worker_cycle"))
            .await
    }

    async fn drain_batch(&self) -> Result<CycleReport, WorkerError> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.settings.stale_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let requeued = job_repo::requeue_stale(&self.db, stale_before)?;
        if requeued > 0 {
            warn!(requeued, "Requeued stale processing jobs");
        }

        let jobs = job_repo::claim_batch(&self.db, self.settings.batch_size, Utc::now())?;
        let mut report = CycleReport {
            claimed: jobs.len(),
            ..Default::default()
        };

        for (index, job) in jobs.iter().enumerate() {
            let span = info_span!(
                "job",
                job_id = job.id,
                tenant_id = job.tenant_id,
                attempt = job.attempts + 1
            );
            match self.process_job(job).instrument(span).await {
                Ok(JobOutcome::Completed) => report.completed += 1,
                Ok(JobOutcome::Retried) => report.retried += 1,
                Ok(JobOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    self.release_unfinished(&jobs[index..]);
                    return Err(e.into());
                }
            }
        }

        Ok(report)
    }

    fn release_unfinished(&self, jobs: &[Job]) {
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        match job_repo::release(&self.db, &ids) {
            Ok(released) => warn!(released, "Released unfinished jobs after a job store error"),
            // The stale threshold still puts them back.
            Err(e) => error!("Failed to release unfinished jobs {:?}: {}", ids, e),
        }
    }

    /// Runs the pipeline for one job and records the outcome. Only job
    /// store errors escape.
    async fn process_job(&self, job: &Job) -> Result<JobOutcome, JobStoreError> {
        let error = match self.pipeline.run(job).await {
            Ok(invoice) => {
                job_repo::mark_completed(&self.db, job.id)?;
                info!(invoice_id = invoice.id, "Job completed");
                self.notifier
                    .text(job.submitter_id, &messages::invoice_processed(&invoice))
                    .await;
                return Ok(JobOutcome::Completed);
            }
            Err(e) => e,
        };

        let attempts = job.attempts + 1;
        let message = error.to_string();

        if !error.is_retryable() || attempts >= job.max_attempts {
            warn!(attempts, error = %message, "Job failed permanently");
            job_repo::mark_failed(&self.db, job.id, attempts, &message)?;
            self.notifier
                .text(job.submitter_id, messages::PROCESSING_FAILED)
                .await;
            return Ok(JobOutcome::Failed);
        }

        let next_attempt_at = self.settings.backoff.next_attempt_at(attempts, Utc::now());
        warn!(
            attempts,
            max_attempts = job.max_attempts,
            error = %message,
            "Job failed, will retry"
        );
        job_repo::mark_retry(&self.db, job.id, attempts, &message, next_attempt_at)?;
        Ok(JobOutcome::Retried)
    }
}
