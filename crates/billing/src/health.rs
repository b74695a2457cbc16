//! Scheduler job health
//!
//! Every scheduled job reports each run here, success or not. Jobs are
//! tracked independently so one failing sweep never hides the others.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::BillingResult;

#[async_trait]
pub trait JobHealthRecorder: Send + Sync {
    async fn record_run(
        &self,
        job_name: &str,
        success: bool,
        error_detail: Option<&str>,
    ) -> BillingResult<()>;
}

/// Latest known state of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHealth {
    pub job_name: String,
    pub last_run_at: OffsetDateTime,
    pub last_success: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_runs: u64,
}

/// Report a job outcome; a failing recorder is logged and ignored
pub async fn record_job_outcome<T>(
    recorder: &dyn JobHealthRecorder,
    job_name: &str,
    result: &BillingResult<T>,
) {
    let error_detail = result.as_ref().err().map(|e| e.to_string());
    if let Err(e) = recorder
        .record_run(job_name, result.is_ok(), error_detail.as_deref())
        .await
    {
        tracing::warn!(job = %job_name, error = %e, "Failed to record job health");
    }
}

/// Upserts into `scheduler_job_health`
#[derive(Clone)]
pub struct PgJobHealthRecorder {
    pool: PgPool,
}

impl PgJobHealthRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobHealthRecorder for PgJobHealthRecorder {
    async fn record_run(
        &self,
        job_name: &str,
        success: bool,
        error_detail: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_job_health
                (job_name, last_run_at, last_success, last_error, consecutive_failures, total_runs)
            VALUES ($1, NOW(), $2, $3, CASE WHEN $2 THEN 0 ELSE 1 END, 1)
            ON CONFLICT (job_name) DO UPDATE SET
                last_run_at = NOW(),
                last_success = EXCLUDED.last_success,
                last_error = EXCLUDED.last_error,
                consecutive_failures = CASE
                    WHEN EXCLUDED.last_success THEN 0
                    ELSE scheduler_job_health.consecutive_failures + 1
                END,
                total_runs = scheduler_job_health.total_runs + 1
            "#,
        )
        .bind(job_name)
        .bind(success)
        .bind(error_detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Keeps job health in memory; readable for tests and local tooling
#[derive(Debug, Default)]
pub struct InMemoryJobHealth {
    jobs: Mutex<HashMap<String, JobHealth>>,
}

impl InMemoryJobHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_name: &str) -> Option<JobHealth> {
        self.jobs.lock().await.get(job_name).cloned()
    }
}

#[async_trait]
impl JobHealthRecorder for InMemoryJobHealth {
    async fn record_run(
        &self,
        job_name: &str,
        success: bool,
        error_detail: Option<&str>,
    ) -> BillingResult<()> {
        let mut jobs = self.jobs.lock().await;
        let now = OffsetDateTime::now_utc();

        let entry = jobs
            .entry(job_name.to_string())
            .or_insert_with(|| JobHealth {
                job_name: job_name.to_string(),
                last_run_at: now,
                last_success: success,
                last_error: None,
                consecutive_failures: 0,
                total_runs: 0,
            });

        entry.last_run_at = now;
        entry.last_success = success;
        entry.last_error = error_detail.map(str::to_string);
        entry.consecutive_failures = if success {
            0
        } else {
            entry.consecutive_failures + 1
        };
        entry.total_runs += 1;

        Ok(())
    }
}
