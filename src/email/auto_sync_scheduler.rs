//! Automatic mailbox synchronization scheduler
//!
//! Every tick enumerates the active mailboxes and runs the ingestion pipeline
//! for each of them in its own task. At most `max_concurrent_syncs` mailboxes
//! sync at once across all ticks, a mailbox that is still syncing from an
//! earlier tick is skipped, and a failing mailbox never affects the others.

use crate::config::SyncSettings;
use crate::email::ingest::{FailureKind, IngestionPipeline, SyncError, SyncFailure, SyncResult};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for automatic mailbox synchronization
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AutoSyncConfig {
    /// Whether automatic sync is enabled
    pub enabled: bool,
    /// Seconds between ticks
    pub interval_seconds: u64,
    /// Whether to run a tick as soon as the scheduler starts
    pub sync_on_startup: bool,
    /// Maximum number of mailboxes synced concurrently
    pub max_concurrent_syncs: usize,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for AutoSyncConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            enabled: settings.enabled,
            interval_seconds: settings.interval_seconds,
            sync_on_startup: settings.sync_on_startup,
            max_concurrent_syncs: settings.max_concurrent_syncs,
        }
    }
}

/// Statistics about automatic synchronization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoSyncStats {
    /// Whether the periodic loop is currently running
    pub is_active: bool,
    /// Next scheduled tick
    pub next_sync_time: Option<DateTime<Utc>>,
    /// Mailboxes found on the last tick
    pub monitored_mailboxes: usize,
    /// Ticks that enumerated mailboxes and ran
    pub total_ticks: u64,
    /// Ticks aborted because the store could not be reached
    pub aborted_ticks: u64,
    /// Mailbox syncs that completed
    pub total_syncs_completed: u64,
    /// Mailbox syncs that could not run (connection, auth, task failure)
    pub total_syncs_failed: u64,
    /// Mailboxes skipped because an earlier sync was still running
    pub skipped_busy: u64,
    /// Messages stored across all ticks
    pub messages_stored: u64,
    /// Last tick completion time
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Wall time of the last tick
    pub last_tick_duration: Option<Duration>,
}

/// Marks a mailbox as syncing until dropped
struct InFlightGuard {
    in_flight: Arc<StdMutex<HashSet<i64>>>,
    alias_id: i64,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<StdMutex<HashSet<i64>>>, alias_id: i64) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(alias_id) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            alias_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.alias_id);
    }
}

/// State shared between the scheduler handle, its loop and tick tasks
struct SchedulerInner {
    pipeline: Arc<IngestionPipeline>,
    limiter: Arc<Semaphore>,
    in_flight: Arc<StdMutex<HashSet<i64>>>,
    stats: Arc<RwLock<AutoSyncStats>>,
}

impl SchedulerInner {
    async fn run_tick(&self) -> Result<Vec<SyncResult>, SyncError> {
        let started = Instant::now();

        let targets = match self.pipeline.directory().list_active_mailbox_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                error!("Failed to enumerate mailboxes, skipping tick: {}", e);
                self.stats.write().await.aborted_ticks += 1;
                return Err(SyncError::StoreUnavailable(e));
            }
        };

        debug!("Sync tick over {} mailboxes", targets.len());
        let mut skipped_busy = 0;
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets.iter().cloned() {
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, target.alias_id) else {
                debug!("{} is still syncing, skipping this tick", target.alias_email);
                skipped_busy += 1;
                continue;
            };

            let pipeline = self.pipeline.clone();
            let limiter = self.limiter.clone();
            let alias_email = target.alias_email.clone();
            let alias_id = target.alias_id;

            let handle: JoinHandle<SyncResult> = tokio::spawn(async move {
                let _guard = guard;
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let mut result = SyncResult::new(target.alias_email.clone(), Some(target.alias_id));
                        result.record(SyncFailure::new(FailureKind::Internal, e.to_string()));
                        return result.finish();
                    }
                };
                pipeline.ingest_target(&target).await
            });
            handles.push((alias_email, alias_id, handle));
        }

        let (owners, tasks): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .map(|(alias_email, alias_id, handle)| ((alias_email, alias_id), handle))
            .unzip();
        let results: Vec<SyncResult> = join_all(tasks)
            .await
            .into_iter()
            .zip(owners)
            .map(|(joined, (alias_email, alias_id))| match joined {
                Ok(result) => result,
                Err(e) => {
                    let mut result = SyncResult::new(alias_email, Some(alias_id));
                    result.record(SyncFailure::new(
                        FailureKind::Internal,
                        format!("sync task failed: {}", e),
                    ));
                    result.finish()
                }
            })
            .collect();

        let failed = results.iter().filter(|r| r.is_failed()).count() as u64;
        let stored: u64 = results.iter().map(|r| r.stored as u64).sum();
        {
            let mut stats = self.stats.write().await;
            stats.total_ticks += 1;
            stats.monitored_mailboxes = targets.len();
            stats.total_syncs_failed += failed;
            stats.total_syncs_completed += results.len() as u64 - failed;
            stats.skipped_busy += skipped_busy;
            stats.messages_stored += stored;
            stats.last_sync_time = Some(Utc::now());
            stats.last_tick_duration = Some(started.elapsed());
        }

        info!(
            "Sync tick finished: {} mailboxes, {} messages stored, {} failed, {} busy",
            results.len(),
            stored,
            failed,
            skipped_busy
        );
        Ok(results)
    }
}

/// Automatic mailbox synchronization scheduler
pub struct AutoSyncScheduler {
    config: Arc<RwLock<AutoSyncConfig>>,
    inner: Arc<SchedulerInner>,
    scheduler_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl AutoSyncScheduler {
    /// Create a new automatic sync scheduler
    pub fn new(pipeline: Arc<IngestionPipeline>, config: AutoSyncConfig) -> Self {
        let permits = config.max_concurrent_syncs.max(1);
        Self {
            config: Arc::new(RwLock::new(config)),
            inner: Arc::new(SchedulerInner {
                pipeline,
                limiter: Arc::new(Semaphore::new(permits)),
                in_flight: Arc::new(StdMutex::new(HashSet::new())),
                stats: Arc::new(RwLock::new(AutoSyncStats::default())),
            }),
            scheduler_handle: Arc::new(Mutex::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the periodic loop. Starting a running scheduler is a no-op.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Ok(());
        }

        let config = self.config.read().await.clone();
        if !config.enabled {
            info!("Automatic sync is disabled");
            return Ok(());
        }

        info!(
            "Starting automatic mailbox sync scheduler (interval: {}s, concurrency: {})",
            config.interval_seconds, config.max_concurrent_syncs
        );

        let period = Duration::from_secs(config.interval_seconds.max(1));
        let first_tick = if config.sync_on_startup {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let inner = self.inner.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                inner.stats.write().await.next_sync_time = chrono::Duration::from_std(period)
                    .ok()
                    .map(|d| Utc::now() + d);

                // A tick runs in its own task so a slow mailbox never delays the schedule
                let tick_inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = tick_inner.run_tick().await {
                        warn!("Sync tick aborted: {}", e);
                    }
                });
            }
        });

        *self.scheduler_handle.lock().await = Some(handle);
        self.inner.stats.write().await.is_active = true;
        *is_running = true;
        info!("Automatic sync scheduler started");
        Ok(())
    }

    /// Stop scheduling new ticks. Mailbox syncs already running finish on their own.
    pub async fn stop(&self) {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return;
        }

        info!("Stopping automatic mailbox sync scheduler");
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            handle.abort();
        }

        {
            let mut stats = self.inner.stats.write().await;
            stats.is_active = false;
            stats.next_sync_time = None;
        }

        *is_running = false;
        info!("Automatic sync scheduler stopped");
    }

    /// Run one tick now and wait for every mailbox to finish
    pub async fn run_once(&self) -> Result<Vec<SyncResult>, SyncError> {
        self.inner.run_tick().await
    }

    /// Get current sync statistics
    pub async fn get_stats(&self) -> AutoSyncStats {
        self.inner.stats.read().await.clone()
    }

    /// Get the current configuration
    pub async fn get_config(&self) -> AutoSyncConfig {
        self.config.read().await.clone()
    }

    /// Whether the periodic loop is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Number of mailboxes currently syncing or waiting for a slot
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for AutoSyncScheduler {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.scheduler_handle.try_lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard() {
        let set = Arc::new(StdMutex::new(HashSet::new()));
        let guard = InFlightGuard::acquire(&set, 7).unwrap();
        assert!(InFlightGuard::acquire(&set, 7).is_none());
        assert!(InFlightGuard::acquire(&set, 8).is_some());
        drop(guard);
        assert!(InFlightGuard::acquire(&set, 7).is_some());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = SyncSettings {
            interval_seconds: 30,
            max_concurrent_syncs: 2,
            ..SyncSettings::default()
        };
        let config = AutoSyncConfig::from(&settings);
        assert_eq!(config.interval_seconds, 30);
        assert_eq!(config.max_concurrent_syncs, 2);
        assert!(config.enabled);
        assert_eq!(AutoSyncConfig::default().interval_seconds, 60);
    }
}
