//! Startup scan
//!
//! Reconciles every replica the pool knows about with bounded
//! parallelism, then rebuilds per-replica space reservations from what
//! survived.

use crate::allocator;
use crate::reconciler::ConsistencyReconciler;
use cachepool_common::{Error, FileId, ReplicaState, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of a full scan
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Identifiers looked at
    pub checked: usize,
    /// Replicas in a stable state afterwards
    pub kept: usize,
    pub broken: usize,
    pub discarded: usize,
    /// Bytes on disk held by surviving replicas
    pub bytes: u64,
    /// Identifiers whose reconciliation failed
    pub failed: Vec<(FileId, Error)>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ReplicaScanner {
    reconciler: Arc<ConsistencyReconciler>,
    concurrency: usize,
}

impl ReplicaScanner {
    pub fn new(reconciler: Arc<ConsistencyReconciler>, concurrency: usize) -> Self {
        Self {
            reconciler,
            concurrency: concurrency.max(1),
        }
    }

    /// Reconcile all known identifiers
    ///
    /// Failures of individual replicas are collected in the report; only
    /// a failure to enumerate the stores aborts the scan.
    pub async fn scan(&self) -> Result<ScanReport> {
        let start = Instant::now();
        let ids = self.reconciler.index()?;
        info!(
            "Scanning {} replicas in pool {} ({} in parallel)",
            ids.len(),
            self.reconciler.pool(),
            self.concurrency
        );

        let outcomes: Vec<_> = stream::iter(ids)
            .map(|id| async move {
                let outcome = self.check(&id).await;
                (id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ScanReport::default();
        for (id, outcome) in outcomes {
            report.checked += 1;
            match outcome {
                Ok(Some((state, size))) => {
                    report.bytes += size;
                    if state == ReplicaState::Broken {
                        report.broken += 1;
                    } else {
                        report.kept += 1;
                    }
                }
                Ok(None) => report.discarded += 1,
                Err(e) => {
                    error!("Failed to reconcile {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            "Scan finished in {:?}: {} kept, {} broken, {} discarded, {} failed, {} bytes",
            start.elapsed(),
            report.kept,
            report.broken,
            report.discarded,
            report.failed.len(),
            report.bytes
        );
        if report.broken > 0 {
            warn!("{} broken replicas need attention", report.broken);
        }
        Ok(report)
    }

    /// Reconcile one replica and reserve space for what is on disk
    async fn check(&self, id: &FileId) -> Result<Option<(ReplicaState, u64)>> {
        let Some(record) = self.reconciler.get(id).await? else {
            return Ok(None);
        };

        let size = self.reconciler.files().size(id)?.unwrap_or(0);
        // An open channel settles its own reservation
        if !self.reconciler.has_open_channel(id) {
            allocator::sync_reservation(self.reconciler.allocator().as_ref(), id, size)?;
        }
        Ok(Some((record.state, size)))
    }
}
