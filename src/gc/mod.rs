//! Network garbage collector
//!
//! A periodic sweep that shuts down guest networks nobody uses any more.
//! A network has to be seen free on two passes at least `gc_wait` apart
//! before it is torn down, so a VM restart that briefly leaves a network
//! without NICs does not cost the tenant their router.
//!
//! The sweep is serialized cluster-wide by the named lock
//! [`GC_LOCK_NAME`]; an instance that cannot get it quickly skips the pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::lock::{LockKey, RowLockGuard};
use crate::model::{NetworkId, ReservationContext};
use crate::orchestrator::NetworkOrchestrator;

pub const GC_LOCK_NAME: &str = "Network.GC.Lock";

// ============================================================================
// Free-network watch list
// ============================================================================

/// When each GC candidate was first observed free
///
/// Owned by one collector; swap in a persistent implementation to survive
/// restarts.
pub trait FreeNetworkWatch: Send + Sync {
    fn first_seen(&self, id: NetworkId) -> Option<DateTime<Utc>>;

    fn record(&self, id: NetworkId, at: DateTime<Utc>);

    fn forget(&self, id: NetworkId);

    /// Drop every entry not in `ids`
    fn retain(&self, ids: &HashSet<NetworkId>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryFreeNetworkWatch {
    seen: DashMap<NetworkId, DateTime<Utc>>,
}

impl InMemoryFreeNetworkWatch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FreeNetworkWatch for InMemoryFreeNetworkWatch {
    fn first_seen(&self, id: NetworkId) -> Option<DateTime<Utc>> {
        self.seen.get(&id).map(|t| *t)
    }

    fn record(&self, id: NetworkId, at: DateTime<Utc>) {
        self.seen.insert(id, at);
    }

    fn forget(&self, id: NetworkId) {
        self.seen.remove(&id);
    }

    fn retain(&self, ids: &HashSet<NetworkId>) {
        self.seen.retain(|id, _| ids.contains(id));
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Another instance held the GC lock
    pub skipped: bool,
    pub candidates: usize,
    /// Networks seen free for the first time
    pub newly_watched: Vec<NetworkId>,
    pub shut_down: Vec<NetworkId>,
    /// Due networks that were gone or busy again by the time their lock was held
    pub in_use: Vec<NetworkId>,
    pub failed: Vec<NetworkId>,
}

/// What happened to one due network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeNetworkOutcome {
    ShutDown,
    InUse,
    Failed,
}

pub struct NetworkGarbageCollector {
    orchestrator: Arc<NetworkOrchestrator>,
    watch: Arc<dyn FreeNetworkWatch>,
    instance: String,
}

impl NetworkGarbageCollector {
    pub fn new(orchestrator: Arc<NetworkOrchestrator>, watch: Arc<dyn FreeNetworkWatch>) -> Self {
        let instance = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            orchestrator,
            watch,
            instance,
        }
    }

    pub fn watch(&self) -> &Arc<dyn FreeNetworkWatch> {
        &self.watch
    }

    pub async fn run(&self) -> Result<GcReport> {
        self.run_at(Utc::now()).await
    }

    /// One sweep as if the clock read `now`
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<GcReport> {
        let config = self.orchestrator.config();
        let locks = self.orchestrator.repos().locks.clone();
        let key = LockKey::Named(GC_LOCK_NAME.to_string());

        let Some(_lock) = RowLockGuard::acquire(locks, key, config.gc_lock_wait()).await? else {
            debug!("GC lock is busy, {} skips this pass", self.instance);
            return Ok(GcReport {
                skipped: true,
                ..GcReport::default()
            });
        };

        let candidates = self.orchestrator.repos().networks.list_gc_candidates().await?;
        let wait = config.gc_wait();

        let mut report = GcReport {
            candidates: candidates.len(),
            ..GcReport::default()
        };
        let mut due = Vec::new();
        for &id in &candidates {
            match self.watch.first_seen(id) {
                None => {
                    self.watch.record(id, now);
                    report.newly_watched.push(id);
                }
                Some(seen) => {
                    let elapsed = now.signed_duration_since(seen).to_std().unwrap_or_default();
                    if elapsed >= wait {
                        due.push(id);
                    }
                }
            }
        }

        // Networks that got NICs back or were removed leave the watch list
        let still_free: HashSet<NetworkId> = candidates.iter().copied().collect();
        self.watch.retain(&still_free);
        for id in &due {
            self.watch.forget(*id);
        }

        let outcomes = join_all(due.iter().map(|&id| self.shutdown_free_network(id))).await;
        for (id, outcome) in due.into_iter().zip(outcomes) {
            match outcome {
                FreeNetworkOutcome::ShutDown => report.shut_down.push(id),
                FreeNetworkOutcome::InUse => report.in_use.push(id),
                FreeNetworkOutcome::Failed => report.failed.push(id),
            }
        }

        info!(
            "GC pass on {}: {} candidates, {} newly watched, {} shut down, {} in use, {} failed",
            self.instance,
            report.candidates,
            report.newly_watched.len(),
            report.shut_down.len(),
            report.in_use.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Shut one due network down if it is still idle under its lock
    async fn shutdown_free_network(&self, id: NetworkId) -> FreeNetworkOutcome {
        match self
            .orchestrator
            .shutdown_idle_network(id, &ReservationContext::system())
            .await
        {
            Ok(Some(true)) => {
                info!("Shut down idle network {}", id);
                FreeNetworkOutcome::ShutDown
            }
            Ok(Some(false)) => {
                warn!("GC could not fully shut down network {}", id);
                FreeNetworkOutcome::Failed
            }
            Ok(None) => {
                debug!("GC candidate {} is gone or in use again", id);
                FreeNetworkOutcome::InUse
            }
            Err(e) => {
                warn!("GC failed to shut down network {}: {}", id, e);
                FreeNetworkOutcome::Failed
            }
        }
    }
}

// ============================================================================
// Background task
// ============================================================================

/// Run the collector every `interval` until the returned sender sends `true`
pub fn spawn_network_gc(gc: Arc<NetworkGarbageCollector>, interval: Duration) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        info!("Network GC started on {}, interval={:?}", gc.instance, interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = gc.run().await {
                        error!("Network GC pass failed: {}", e);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Network GC shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
