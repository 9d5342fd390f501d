//! Reconciliation sweeper for catalog/object drift
//!
//! Objects can disappear underneath their catalog rows (bucket
//! lifecycle rules, manual cleanup, a crashed deletion). The sweeper
//! walks live rows past a grace age, probes each backing object with a
//! bounded wait, and tombstones rows whose objects are confirmed
//! absent. A probe that cannot get an answer proves nothing and never
//! tombstones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use tokio::time;

use crate::blob::{probe_locator, BlobStore, ProbeOutcome};
use crate::config::ReconcileConfig;
use crate::db::{ArtifactRepository, DeleteReason, FileRecord};
use crate::error::Result;

/// What one sweep pass should cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepScope {
    AllUsers,
    User(i64),
}

/// Tally of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub tombstoned: usize,
    pub ambiguous: usize,
}

pub struct ReconcileWorker {
    repository: Arc<ArtifactRepository>,
    blob_store: Arc<dyn BlobStore>,
    sweep_interval: Duration,
    grace_days: i64,
    probe_timeout: Duration,
    workers: usize,
    batch_size: usize,
}

impl ReconcileWorker {
    pub fn new(
        repository: Arc<ArtifactRepository>,
        blob_store: Arc<dyn BlobStore>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            repository,
            blob_store,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            grace_days: config.grace_days,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            workers: config.workers,
            batch_size: config.batch_size,
        }
    }

    /// Run one sweep pass over at most `batch_size` candidates. Probes run
    /// concurrently; tombstoning is applied afterwards so a slow store
    /// never holds the catalog lock.
    pub async fn sweep(&self, scope: SweepScope) -> Result<SweepReport> {
        let cutoff = Utc::now() - chrono::Duration::days(self.grace_days);
        let candidates = match scope {
            SweepScope::AllUsers => self
                .repository
                .live_files_older_than(cutoff, self.batch_size)?,
            SweepScope::User(user_id) => self.repository.live_files_older_than_for_user(
                user_id,
                cutoff,
                self.batch_size,
            )?,
        };
        if candidates.is_empty() {
            return Ok(SweepReport::default());
        }

        let timeout = self.probe_timeout;
        let store = self.blob_store.as_ref();
        let probes: Vec<(FileRecord, ProbeOutcome)> = stream::iter(candidates)
            .map(|file| async move {
                let outcome = probe_locator(store, &file.locator, timeout).await;
                (file, outcome)
            })
            .buffer_unordered(self.workers.max(1))
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (file, outcome) in probes {
            report.checked += 1;
            match outcome {
                ProbeOutcome::Exists => {}
                ProbeOutcome::Missing => {
                    if self
                        .repository
                        .soft_delete_file(file.id, DeleteReason::Lifecycle)?
                    {
                        report.tombstoned += 1;
                        info!(
                            "Reconciled file {} ({}): backing object is gone",
                            file.id, file.locator
                        );
                    }
                }
                ProbeOutcome::Ambiguous(reason) => {
                    report.ambiguous += 1;
                    warn!(
                        "Probe of file {} ({}) was inconclusive: {}",
                        file.id, file.locator, reason
                    );
                }
            }
        }

        if report.tombstoned > 0 || report.ambiguous > 0 {
            info!(
                "Sweep checked {} files: {} tombstoned, {} ambiguous",
                report.checked, report.tombstoned, report.ambiguous
            );
        }
        Ok(report)
    }

    /// Start the periodic all-user sweep as a background task (non-blocking)
    pub fn start_background(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting reconciliation sweeper with {}s interval",
            self.sweep_interval.as_secs()
        );

        tokio::spawn(async move {
            let mut interval = time::interval(self.sweep_interval);

            loop {
                interval.tick().await;

                if let Err(e) = self.sweep(SweepScope::AllUsers).await {
                    error!("Reconciliation sweep failed: {}", e);
                }
            }
        })
    }

    /// Kick off a fire-and-forget sweep of one user's files
    pub fn spawn_user_sweep(self: Arc<Self>, user_id: i64) {
        tokio::spawn(async move {
            if let Err(e) = self.sweep(SweepScope::User(user_id)).await {
                error!("Session sweep for user {} failed: {}", user_id, e);
            }
        });
    }
}
