//! Per-source resource pool.
//!
//! Each source gets exactly one long-lived resource (an HTTP client, a browser
//! session, ...), created lazily on first use and reused across tasks. The
//! pool is the only owner: callers borrow through [`ResourcePool::acquire`] and
//! never close what they get back.
//!
//! # Health Checks
//!
//! Every `acquire` checks two conditions before handing a resource out:
//!
//! 1. **Staleness**: the resource has been idle longer than the restart
//!    interval. Only that resource is recreated.
//! 2. **Memory pressure**: process memory exceeds the threshold. Memory is not
//!    attributable to one resource, so *all* resources are torn down and the
//!    caller gets a freshly created one.
//!
//! Teardown is best-effort. Close failures are logged and counted in a
//! [`TeardownReport`], never returned to the caller.

use crate::collaborators::{ResourceError, ResourceFactory};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Reports current process memory usage.
pub trait MemoryProbe: Send + Sync {
    fn used_mb(&self) -> u64;
}

/// Resident memory of the current process, read through `sysinfo`.
pub struct ProcessMemoryProbe {
    sys: std::sync::Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            sys: std::sync::Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_mb(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        let Ok(mut sys) = self.sys.lock() else {
            return 0;
        };
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid)
            .map(|p| p.memory() / 1024 / 1024)
            .unwrap_or(0)
    }
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub closed: usize,
    pub failed: usize,
}

struct PoolEntry<R> {
    resource: Arc<R>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    borrows: usize,
}

pub struct ResourcePool<R> {
    factory: Arc<dyn ResourceFactory<R>>,
    memory: Arc<dyn MemoryProbe>,
    restart_interval: Duration,
    memory_threshold_mb: u64,
    entries: Mutex<HashMap<String, PoolEntry<R>>>,
}

impl<R> fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("restart_interval", &self.restart_interval)
            .field("memory_threshold_mb", &self.memory_threshold_mb)
            .finish()
    }
}

impl<R: Send + Sync + 'static> ResourcePool<R> {
    /// # Arguments
    ///
    /// * `factory` - Creates and closes resources
    /// * `memory` - Process memory probe used for global remediation
    /// * `restart_interval` - Idle time after which a resource is recreated
    /// * `memory_threshold_mb` - Process memory above which every resource is recreated
    pub fn new(
        factory: Arc<dyn ResourceFactory<R>>,
        memory: Arc<dyn MemoryProbe>,
        restart_interval: Duration,
        memory_threshold_mb: u64,
    ) -> Self {
        Self {
            factory,
            memory,
            restart_interval,
            memory_threshold_mb,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Borrow the resource for `source`, creating or restarting it as needed.
    pub async fn acquire(&self, source: &str) -> Result<Arc<R>, ResourceError> {
        self.acquire_at(source, Utc::now()).await
    }

    #[instrument(level = "debug", skip(self, now))]
    pub(crate) async fn acquire_at(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<R>, ResourceError> {
        let used_mb = self.memory.used_mb();
        if used_mb > self.memory_threshold_mb {
            warn!(
                used_mb,
                threshold_mb = self.memory_threshold_mb,
                "Memory threshold exceeded; restarting all pooled resources"
            );
            self.teardown_all().await;
        }

        let stale = {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(source) {
                if !self.is_stale(entry, now) {
                    entry.borrows += 1;
                    entry.last_activity = now;
                    return Ok(Arc::clone(&entry.resource));
                }
            }
            entries.remove(source)
        };

        if let Some(entry) = stale {
            info!(
                source,
                created_at = %entry.created_at,
                last_activity = %entry.last_activity,
                "Pooled resource idle too long; restarting"
            );
            self.close_quietly(source, entry.resource).await;
        }

        let resource = Arc::new(self.factory.create(source).await?);
        debug!(source, "Created pooled resource");

        let replaced = self.entries.lock().await.insert(
            source.to_string(),
            PoolEntry {
                resource: Arc::clone(&resource),
                created_at: now,
                last_activity: now,
                borrows: 1,
            },
        );
        if let Some(old) = replaced {
            self.close_quietly(source, old.resource).await;
        }
        Ok(resource)
    }

    fn is_stale(&self, entry: &PoolEntry<R>, now: DateTime<Utc>) -> bool {
        let idle = (now - entry.last_activity).to_std().unwrap_or_default();
        idle > self.restart_interval
    }

    /// Return a borrowed resource. The resource stays pooled.
    pub async fn release(&self, source: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(source) {
            entry.borrows = entry.borrows.saturating_sub(1);
            entry.last_activity = Utc::now();
        }
    }

    /// Record a use of the resource for `source`, successful or not.
    pub async fn mark_activity(&self, source: &str) {
        self.mark_activity_at(source, Utc::now()).await;
    }

    pub(crate) async fn mark_activity_at(&self, source: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.lock().await.get_mut(source) {
            entry.last_activity = now;
        }
    }

    /// Close every pooled resource concurrently, best-effort.
    #[instrument(level = "info", skip_all)]
    pub async fn teardown_all(&self) -> TeardownReport {
        let drained: Vec<(String, PoolEntry<R>)> =
            self.entries.lock().await.drain().collect();
        if drained.is_empty() {
            return TeardownReport::default();
        }

        let results = join_all(drained.into_iter().map(|(source, entry)| async move {
            if entry.borrows > 0 {
                debug!(%source, borrows = entry.borrows, "Closing resource that is still borrowed");
            }
            let result = self.factory.close(&source, entry.resource).await;
            (source, result)
        }))
        .await;

        let mut report = TeardownReport::default();
        for (source, result) in results {
            match result {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!(%source, error = %e, "Failed to close pooled resource; continuing");
                    report.failed += 1;
                }
            }
        }
        info!(closed = report.closed, failed = report.failed, "Pooled resources torn down");
        report
    }

    /// Final teardown on shutdown.
    pub async fn shutdown(&self) -> TeardownReport {
        self.teardown_all().await
    }

    async fn close_quietly(&self, source: &str, resource: Arc<R>) {
        if let Err(e) = self.factory.close(source, resource).await {
            warn!(source, error = %e, "Failed to close pooled resource; continuing");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Session {
        id: usize,
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        closed: AtomicUsize,
        fail_close: bool,
    }

    #[async_trait]
    impl ResourceFactory<Session> for CountingFactory {
        async fn create(&self, _source: &str) -> Result<Session, ResourceError> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Session { id })
        }

        async fn close(&self, source: &str, _resource: Arc<Session>) -> Result<(), ResourceError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(ResourceError::Close {
                    source_id: source.to_string(),
                    reason: "browser already gone".to_string(),
                });
            }
            Ok(())
        }
    }

    struct FakeMemory(AtomicU64);

    impl MemoryProbe for FakeMemory {
        fn used_mb(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn pool(factory: Arc<CountingFactory>, memory: Arc<FakeMemory>) -> ResourcePool<Session> {
        ResourcePool::new(factory, memory, Duration::from_secs(1800), 2048)
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_reuses_resource() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(Arc::clone(&factory), Arc::new(FakeMemory(AtomicU64::new(100))));

        let a = pool.acquire_at("golf.com", ts(0)).await.unwrap();
        pool.release("golf.com").await;
        let b = pool.acquire_at("golf.com", ts(10)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let c = pool.acquire_at("golfdigest.com", ts(10)).await.unwrap();
        assert_ne!(a.id, c.id);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_idle_resource_is_recreated() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(Arc::clone(&factory), Arc::new(FakeMemory(AtomicU64::new(100))));

        let a = pool.acquire_at("golf.com", ts(0)).await.unwrap();
        pool.mark_activity_at("golf.com", ts(100)).await;
        let b = pool.acquire_at("golf.com", ts(100 + 1801)).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_pressure_restarts_everything() {
        let factory = Arc::new(CountingFactory::default());
        let memory = Arc::new(FakeMemory(AtomicU64::new(100)));
        let pool = pool(Arc::clone(&factory), Arc::clone(&memory));

        let a = pool.acquire_at("golf.com", ts(0)).await.unwrap();
        let b = pool.acquire_at("golfdigest.com", ts(0)).await.unwrap();

        memory.0.store(4096, Ordering::SeqCst);
        let c = pool.acquire_at("golf.com", ts(1)).await.unwrap();
        assert_ne!(a.id, c.id);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 1);

        memory.0.store(100, Ordering::SeqCst);
        let d = pool.acquire_at("golfdigest.com", ts(2)).await.unwrap();
        assert_ne!(b.id, d.id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_teardown_failures_are_swallowed() {
        let factory = Arc::new(CountingFactory {
            fail_close: true,
            ..Default::default()
        });
        let pool = pool(Arc::clone(&factory), Arc::new(FakeMemory(AtomicU64::new(100))));
        pool.acquire_at("golf.com", ts(0)).await.unwrap();
        pool.acquire_at("golfdigest.com", ts(0)).await.unwrap();

        let report = pool.shutdown().await;
        assert_eq!(report, TeardownReport { closed: 0, failed: 2 });
        assert_eq!(pool.len().await, 0);

        // Still usable after a failed teardown.
        assert!(pool.acquire_at("golf.com", ts(1)).await.is_ok());
    }
}
