//! Auto-finish guard for requests the client never confirmed.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::DispatchConfig;
use crate::service::DispatchService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub finished: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct AutoFinishSweep {
    service: Arc<DispatchService>,
}

impl AutoFinishSweep {
    pub fn new(service: Arc<DispatchService>) -> Self {
        Self { service }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Finishes every request still awaiting confirmation a full window after
    /// the provider reported completion. Safe to run concurrently with client
    /// confirmations and with itself.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.service.search_config().auto_finish_window();
        let due = self
            .service
            .store()
            .list_pending_confirmation_before(cutoff)
            .await
            .context("listing requests pending client confirmation")?;

        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };
        for request in &due {
            match self.service.auto_finish(request, now).await {
                Ok(Some(_)) => report.finished += 1,
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(request_id = %request.id, error = %err, "auto-finish failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            scanned = report.scanned,
            finished = report.finished,
            skipped = report.skipped,
            failed = report.failed,
            "auto-finish sweep complete"
        );
        Ok(report)
    }
}

pub async fn maybe_build_scheduler(
    config: &DispatchConfig,
    service: Arc<DispatchService>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.auto_finish_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let sweep = AutoFinishSweep::new(service.clone());
        Box::pin(async move {
            if let Err(err) = sweep.run_once().await {
                warn!(error = %err, "scheduled auto-finish sweep failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
