use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::{sync::mpsc, time};
use tracing::{error, info};

use crate::{
    error::IngestError,
    models::{BuildSummary, IngestErrorPayload, JobState},
    AppState,
};

const PROGRESS_START: f64 = 5.0;
const PROGRESS_SPAN: f64 = 90.0;

/// Runs ingestion jobs one at a time. Upserts never overlap, so two jobs
/// touching the same table cannot race.
pub fn spawn_ingest_worker(state: AppState, mut queue_rx: mpsc::Receiver<String>) {
    tokio::spawn(async move {
        while let Some(job_id) = queue_rx.recv().await {
            info!(job_id = %job_id, "Worker picked ingest job");
            if let Err(err) = process_ingest_job(state.clone(), &job_id).await {
                error!("Ingest job {job_id} failed: {err:#}");
                let code = err
                    .downcast_ref::<IngestError>()
                    .map(IngestError::code)
                    .unwrap_or("INGEST_FAILED");
                let mut jobs = state.jobs.write().await;
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobState::Failed;
                    job.progress = 100.0;
                    job.updated_at = Utc::now();
                    job.error = Some(IngestErrorPayload {
                        code: code.to_string(),
                        message: format!("{err:#}"),
                    });
                    job.message = Some("Ingestion failed".to_string());
                    job.request = None;
                }
            }
        }
    });
}

pub fn spawn_cleanup_worker(state: AppState) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = cleanup_finished_jobs(&state).await;
            if removed > 0 {
                info!(removed, "Dropped expired job records");
            }
        }
    });
}

/// Forgets completed, failed and canceled jobs whose last update is older
/// than the retention window. Queued and running jobs are never touched.
pub async fn cleanup_finished_jobs(state: &AppState) -> usize {
    let cutoff = i64::try_from(state.config.job_retention_seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|retention| Utc::now().checked_sub_signed(retention));
    let Some(cutoff) = cutoff else {
        return 0;
    };

    let mut jobs = state.jobs.write().await;
    let before = jobs.len();
    jobs.retain(|_, job| {
        !(matches!(
            job.status,
            JobState::Completed | JobState::Failed | JobState::Canceled
        ) && job.updated_at <= cutoff)
    });
    before - jobs.len()
}

async fn process_ingest_job(state: AppState, job_id: &str) -> Result<()> {
    let request = {
        let mut jobs = state.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            anyhow::bail!("Unknown job id: {job_id}");
        };

        if matches!(job.status, JobState::Canceled) {
            info!("Skipping canceled job {job_id}");
            return Ok(());
        }

        job.status = JobState::Running;
        job.progress = PROGRESS_START;
        job.message = Some("Resolving table lines".to_string());
        job.updated_at = Utc::now();
        job.error = None;

        job.request.clone().context("Missing request payload")?
    };

    info!(
        job_id = %job_id,
        source = request.source.as_deref().unwrap_or("request"),
        bytes = request.text.len(),
        headers = request.headers.as_ref().map(Vec::len).unwrap_or(0),
        "Ingest job started"
    );

    let service = state.service.clone();
    let jobs = state.jobs.clone();
    let progress_job_id = job_id.to_string();
    let summary: BuildSummary = tokio::task::spawn_blocking(move || {
        let mut service = service
            .lock()
            .map_err(|_| anyhow!("Index service lock poisoned"))?;
        let summary = service.ingest(&request, |done, total| {
            let progress = PROGRESS_START + PROGRESS_SPAN * done as f64 / total.max(1) as f64;
            let mut jobs = jobs.blocking_write();
            if let Some(job) = jobs.get_mut(&progress_job_id) {
                job.progress = progress;
                job.message = Some(format!("Processed {done}/{total} lines"));
                job.updated_at = Utc::now();
            }
        })?;
        Ok::<_, anyhow::Error>(summary)
    })
    .await
    .context("Ingest task join error")??;

    let mut jobs = state.jobs.write().await;
    if let Some(job) = jobs.get_mut(job_id) {
        job.status = JobState::Completed;
        job.progress = 100.0;
        job.message = Some(format!(
            "Upserted {} tables, registered {} keys",
            summary.tables_upserted, summary.keys_registered
        ));
        job.updated_at = Utc::now();
        job.summary = Some(summary.clone());
        job.error = None;
        job.request = None;
    }

    info!(
        job_id = %job_id,
        tables = summary.tables_upserted,
        skipped = summary.nodes_skipped,
        keys = summary.keys_registered,
        "Ingest job completed"
    );

    Ok(())
}
