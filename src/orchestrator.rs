//! Control surface: start (cold or resumed), stop, status.
//!
//! [`Orchestrator::run`] wires the pool, retry engine, scheduler, monitor and
//! snapshot store together, then:
//!
//! 1. restores the snapshot (resume only)
//! 2. queues the selected sources
//! 3. starts the snapshot, health and progress loops
//! 4. runs both worker loops until the work drains or stop is requested
//! 5. stops the loops, tears down the pool and writes the final snapshot
//!
//! A failed periodic snapshot is logged; a failed final snapshot is an error.

use crate::collaborators::{ArticleProcessor, Diagnoser, Discoverer, ResourceFactory};
use crate::config::OrchestratorConfig;
use crate::monitor::{FinalReport, HealthMonitor, ProgressReport};
use crate::pool::{MemoryProbe, ResourcePool};
use crate::priority::PriorityPolicy;
use crate::retry::{RetryEngine, RetryPolicy};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotStore};
use crate::state::{ProcessingState, SharedState};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Ignore any snapshot and start from an empty state.
    Cold,
    /// Continue from a fresh snapshot when one exists.
    Resume,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("orchestrator is already running")]
    AlreadyRunning,
}

/// The injected collaborators for one run.
pub struct Collaborators<R> {
    pub factory: Arc<dyn ResourceFactory<R>>,
    pub discoverer: Arc<dyn Discoverer<R>>,
    pub processor: Arc<dyn ArticleProcessor>,
    pub diagnoser: Arc<dyn Diagnoser>,
    pub priority: Arc<dyn PriorityPolicy>,
    pub memory: Arc<dyn MemoryProbe>,
}

pub struct Orchestrator<R> {
    config: Arc<OrchestratorConfig>,
    sources: Vec<String>,
    state: SharedState,
    pool: Arc<ResourcePool<R>>,
    scheduler: Scheduler<R>,
    monitor: Arc<HealthMonitor>,
    store: SnapshotStore,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl<R: Send + Sync + 'static> Orchestrator<R> {
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `sources` - Source names to discover, in order
    /// * `collaborators` - External adapters
    pub fn new(
        config: OrchestratorConfig,
        sources: Vec<String>,
        collaborators: Collaborators<R>,
    ) -> Self {
        let state: SharedState = Arc::new(Mutex::new(ProcessingState::new(Utc::now())));
        let shutdown = CancellationToken::new();
        let pool = Arc::new(ResourcePool::new(
            collaborators.factory,
            collaborators.memory,
            config.resource_restart_interval(),
            config.memory_threshold_mb,
        ));
        let retry = Arc::new(RetryEngine::new(
            RetryPolicy::from_config(&config),
            Arc::clone(&state),
            collaborators.diagnoser,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&state),
            Arc::clone(&pool),
            collaborators.discoverer,
            collaborators.processor,
            collaborators.priority,
            Arc::clone(&retry),
            SchedulerSettings::from_config(&config),
            shutdown.clone(),
        );
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&state),
            retry,
            config.stuck_timeout(),
            config.progress_file.clone(),
        ));
        let store = SnapshotStore::new(config.state_file.clone(), config.snapshot_freshness());

        Self {
            config: Arc::new(config),
            sources,
            state,
            pool,
            scheduler,
            monitor,
            store,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Request a graceful stop. In-flight work finishes, nothing new starts.
    pub fn stop(&self) {
        info!("Stop requested");
        self.shutdown.cancel();
    }

    /// Current counters and queue depths.
    pub async fn status(&self) -> ProgressReport {
        self.monitor.report_progress(Utc::now()).await
    }

    /// Run until all work drains or stop is requested.
    #[instrument(level = "info", skip(self), fields(sources = self.sources.len()))]
    pub async fn run(&self, mode: StartMode) -> Result<FinalReport, OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let result = self.run_once(mode).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_once(&self, mode: StartMode) -> Result<FinalReport, OrchestratorError> {
        if mode == StartMode::Resume {
            if let Some(restored) = self.store.restore().await? {
                *self.state.lock().await = restored;
            }
        } else {
            info!("Cold start requested; ignoring any snapshot");
        }

        for source in &self.sources {
            self.scheduler.enqueue_source(source).await;
        }

        let loops_token = self.shutdown.child_token();
        let mut loops = self.spawn_loops(&loops_token);

        tokio::join!(self.scheduler.run_sources(), self.scheduler.run_articles());
        if self.scheduler.drain().await {
            info!("All work drained");
        } else {
            warn!("Stopped before all work drained; remaining work is kept in the snapshot");
        }

        loops_token.cancel();
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Periodic loop aborted");
            }
        }

        let teardown = self.pool.shutdown().await;
        if teardown.failed > 0 {
            warn!(failed = teardown.failed, "Some pooled resources failed to close");
        }

        let snapshot = Snapshot::capture(&*self.state.lock().await, Utc::now());
        self.store.save(&snapshot).await?;

        if let Err(e) = self.monitor.publish_progress(Utc::now()).await {
            warn!(error = %e, "Failed to write final progress feed");
        }
        let report = self.monitor.final_report(Utc::now()).await;
        report.log();
        Ok(report)
    }

    fn spawn_loops(&self, token: &CancellationToken) -> JoinSet<()> {
        let mut loops = JoinSet::new();

        let state = Arc::clone(&self.state);
        let store = self.store.clone();
        loops.spawn(every(self.config.snapshot_interval(), token.clone(), move || {
            let state = Arc::clone(&state);
            let store = store.clone();
            async move {
                let snapshot = Snapshot::capture(&*state.lock().await, Utc::now());
                if let Err(e) = store.save(&snapshot).await {
                    error!(error = %e, "Periodic snapshot failed; keeping previous snapshot");
                }
            }
        }));

        let monitor = Arc::clone(&self.monitor);
        loops.spawn(every(self.config.health_check_interval(), token.clone(), move || {
            let monitor = Arc::clone(&monitor);
            async move {
                let reaped = monitor.scan_stuck(Utc::now()).await;
                if reaped > 0 {
                    warn!(reaped, "Requeued stuck articles");
                }
            }
        }));

        let monitor = Arc::clone(&self.monitor);
        loops.spawn(every(self.config.progress_interval(), token.clone(), move || {
            let monitor = Arc::clone(&monitor);
            async move {
                if let Err(e) = monitor.publish_progress(Utc::now()).await {
                    warn!(error = %e, "Failed to write progress feed");
                }
            }
        }));

        loops
    }
}

/// Run `tick` every `period` until `token` is cancelled. The first run is one
/// period after start.
async fn every<F, Fut>(period: Duration, token: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::diagnosis::KeywordDiagnoser;
    use crate::collaborators::{
        DiscoveredArticle, DiscoveryError, ProcessingError, ResourceError,
    };
    use crate::config::SourceConfig;
    use crate::monitor::read_progress_feed;
    use crate::priority::WeightedPriority;
    use crate::state::ArticleLocation;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    struct NoopFactory;

    #[async_trait]
    impl ResourceFactory<()> for NoopFactory {
        async fn create(&self, _source: &str) -> Result<(), ResourceError> {
            Ok(())
        }

        async fn close(&self, _source: &str, _resource: Arc<()>) -> Result<(), ResourceError> {
            Ok(())
        }
    }

    struct NoMemory;

    impl MemoryProbe for NoMemory {
        fn used_mb(&self) -> u64 {
            0
        }
    }

    struct ListDiscoverer;

    #[async_trait]
    impl Discoverer<()> for ListDiscoverer {
        async fn discover(
            &self,
            source: &str,
            _resource: &(),
        ) -> Result<Vec<DiscoveredArticle>, DiscoveryError> {
            Ok((0..3)
                .map(|i| DiscoveredArticle::new(format!("https://{source}/news/{i}")))
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingProcessor {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ArticleProcessor for RecordingProcessor {
        async fn process(&self, url: &str) -> Result<(), ProcessingError> {
            self.seen.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    fn config(dir: &Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.sources = vec![
            SourceConfig::named("golf.com", 1.3),
            SourceConfig::named("golfdigest.com", 1.1),
        ];
        config.idle_poll_ms = 10;
        config.state_file = dir.join("state.json");
        config.progress_file = dir.join("progress.json");
        config
    }

    fn orchestrator(
        config: OrchestratorConfig,
        processor: Arc<RecordingProcessor>,
    ) -> Orchestrator<()> {
        let sources = config.select_sources(&[]);
        let priority = Arc::new(WeightedPriority::from_config(&config));
        Orchestrator::new(
            config,
            sources,
            Collaborators {
                factory: Arc::new(NoopFactory),
                discoverer: Arc::new(ListDiscoverer),
                processor,
                diagnoser: Arc::new(KeywordDiagnoser),
                priority,
                memory: Arc::new(NoMemory),
            },
        )
    }

    #[tokio::test]
    async fn test_cold_run_processes_everything_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let processor = Arc::new(RecordingProcessor::default());
        let orchestrator = orchestrator(config.clone(), Arc::clone(&processor));

        let report = orchestrator.run(StartMode::Cold).await.unwrap();
        assert_eq!(report.progress.succeeded, 6);
        assert_eq!(report.progress.failed, 0);
        assert_eq!(report.completed_sources, vec!["golf.com", "golfdigest.com"]);
        assert_eq!(processor.seen.lock().unwrap().len(), 6);

        let store = SnapshotStore::new(&config.state_file, config.snapshot_freshness());
        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.completed.len(), 6);
        assert!(snapshot.articles.is_empty());

        let feed = read_progress_feed(&config.progress_file).await.unwrap();
        assert_eq!(feed.succeeded, 6);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_and_finishes_queued() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut previous = ProcessingState::new(Utc::now());
        previous.enqueue_article("https://golf.com/news/0", "golf.com", 1.3, Utc::now());
        previous.next_article(Utc::now());
        previous.complete_article("https://golf.com/news/0");
        previous.enqueue_article("https://other.com/news/x", "other.com", 1.0, Utc::now());
        let store = SnapshotStore::new(&config.state_file, config.snapshot_freshness());
        store.save(&Snapshot::capture(&previous, Utc::now())).await.unwrap();

        let processor = Arc::new(RecordingProcessor::default());
        let orchestrator = orchestrator(config, Arc::clone(&processor));
        let report = orchestrator.run(StartMode::Resume).await.unwrap();

        let seen = processor.seen.lock().unwrap().clone();
        assert!(!seen.contains(&"https://golf.com/news/0".to_string()));
        assert!(seen.contains(&"https://other.com/news/x".to_string()));
        assert_eq!(seen.len(), 6);
        assert_eq!(report.progress.succeeded, 7);
        assert_eq!(report.progress.skipped, 1);
    }

    #[tokio::test]
    async fn test_resume_does_not_recount_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut previous = ProcessingState::new(Utc::now());
        previous.enqueue_source("golf.com");
        previous.enqueue_source("golfdigest.com");
        previous.next_source().unwrap();
        previous.finish_source("golf.com");
        let failed = previous.next_source().unwrap();
        previous.take_source_in_flight("golfdigest.com");
        previous.fail_source(failed);
        let store = SnapshotStore::new(&config.state_file, config.snapshot_freshness());
        store.save(&Snapshot::capture(&previous, Utc::now())).await.unwrap();

        let orchestrator = orchestrator(config, Arc::new(RecordingProcessor::default()));
        let report = orchestrator.run(StartMode::Resume).await.unwrap();

        assert_eq!(report.progress.total_sources, 2);
        assert_eq!(report.progress.failed_sources, 0);
        assert_eq!(report.completed_sources, vec!["golf.com", "golfdigest.com"]);
        assert!(report.failed_sources.is_empty());

        let again = orchestrator.run(StartMode::Resume).await.unwrap();
        assert_eq!(again.progress.total_sources, 2);
    }

    #[tokio::test]
    async fn test_resume_with_corrupt_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.state_file, "{ not json").unwrap();

        let orchestrator = orchestrator(config, Arc::new(RecordingProcessor::default()));
        let err = orchestrator.run(StartMode::Resume).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Snapshot(SnapshotError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_stop_before_run_persists_queued_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let processor = Arc::new(RecordingProcessor::default());
        let orchestrator = orchestrator(config.clone(), Arc::clone(&processor));

        orchestrator.stop();
        let report = orchestrator.run(StartMode::Cold).await.unwrap();
        assert_eq!(report.progress.succeeded, 0);
        assert!(processor.seen.lock().unwrap().is_empty());

        let store = SnapshotStore::new(&config.state_file, config.snapshot_freshness());
        let restored = store.restore().await.unwrap().unwrap();
        assert_eq!(restored.source_queue_len(), 2);
        assert_eq!(restored.locate("https://golf.com/news/0"), None::<ArticleLocation>);
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            orchestrator(config(dir.path()), Arc::new(RecordingProcessor::default()));
        orchestrator
            .scheduler
            .enqueue_article("https://golf.com/news/9", "golf.com")
            .await;
        let status = orchestrator.status().await;
        assert_eq!(status.queued, 1);
        assert_eq!(status.total_articles, 1);
    }
}
