//! Two-level task scheduler.
//!
//! Sources are discovered by up to `max_concurrent_sources` workers; the URLs
//! they find feed a priority queue of articles processed by up to
//! `max_concurrent_articles` workers. Both loops are `JoinSet`s whose size is
//! the live worker count.
//!
//! # Worker boundary
//!
//! Nothing a collaborator does can take a loop down. Errors and panics are
//! converted into failure handoffs to the [`RetryEngine`]:
//!
//! ```text
//! run_sources:  acquire -> discover -> mark_activity -> release -> enqueue_article*
//!                  └──── error / panic ───► handle_source_failure
//! run_articles: next_article -> process -> complete_article
//!                  └──── error / panic ───► handle_article_failure
//! ```
//!
//! The state lock is never held across a collaborator call.

use crate::collaborators::{ArticleProcessor, DiscoveredArticle, Discoverer};
use crate::config::OrchestratorConfig;
use crate::model::{ArticleTask, SourceTask};
use crate::pool::ResourcePool;
use crate::priority::PriorityPolicy;
use crate::retry::RetryEngine;
use crate::state::SharedState;
use crate::utils::truncate_for_log;
use chrono::Utc;
use futures::FutureExt;
use itertools::Itertools;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_DISCOVERY_LIMIT: usize = 30;

/// Caps and limits the scheduler runs with.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_sources: usize,
    pub max_concurrent_articles: usize,
    pub idle_poll: Duration,
    /// Per-source cap on URLs taken from one discovery pass.
    pub discovery_limits: HashMap<String, usize>,
}

impl SchedulerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent_sources: config.max_concurrent_sources,
            max_concurrent_articles: config.max_concurrent_articles,
            idle_poll: config.idle_poll(),
            discovery_limits: config
                .sources
                .iter()
                .map(|s| (s.name.clone(), s.discovery_limit))
                .collect(),
        }
    }

    fn discovery_limit(&self, source: &str) -> usize {
        self.discovery_limits
            .get(source)
            .copied()
            .unwrap_or(DEFAULT_DISCOVERY_LIMIT)
    }
}

pub struct Scheduler<R> {
    state: SharedState,
    pool: Arc<ResourcePool<R>>,
    discoverer: Arc<dyn Discoverer<R>>,
    processor: Arc<dyn ArticleProcessor>,
    priority: Arc<dyn PriorityPolicy>,
    retry: Arc<RetryEngine>,
    settings: Arc<SchedulerSettings>,
    shutdown: CancellationToken,
}

impl<R> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            pool: Arc::clone(&self.pool),
            discoverer: Arc::clone(&self.discoverer),
            processor: Arc::clone(&self.processor),
            priority: Arc::clone(&self.priority),
            retry: Arc::clone(&self.retry),
            settings: Arc::clone(&self.settings),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<R: Send + Sync + 'static> Scheduler<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        pool: Arc<ResourcePool<R>>,
        discoverer: Arc<dyn Discoverer<R>>,
        processor: Arc<dyn ArticleProcessor>,
        priority: Arc<dyn PriorityPolicy>,
        retry: Arc<RetryEngine>,
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            pool,
            discoverer,
            processor,
            priority,
            retry,
            settings: Arc::new(settings),
            shutdown,
        }
    }

    /// Queue a source for discovery. Returns whether it was added.
    pub async fn enqueue_source(&self, id: &str) -> bool {
        let added = self.state.lock().await.enqueue_source(id);
        if added {
            debug!(source = id, "Source queued");
        }
        added
    }

    /// Queue an article with the policy's priority. Returns whether it was added.
    pub async fn enqueue_article(&self, url: &str, source: &str) -> bool {
        let priority = self.priority.priority(url, source);
        self.state
            .lock()
            .await
            .enqueue_article(url, source, priority, Utc::now())
    }

    /// Run discovery workers until no source work is left or stop is requested.
    #[instrument(level = "info", skip_all)]
    pub async fn run_sources(&self) {
        let cap = self.settings.max_concurrent_sources;
        let mut workers = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            while workers.len() < cap {
                let next = self.state.lock().await.next_source();
                let Some(task) = next else { break };
                let this = self.clone();
                workers.spawn(async move { this.discover_source(task).await });
            }

            let idle = self.state.lock().await.sources_idle();
            if workers.is_empty() && idle {
                break;
            }
            self.wait_for_worker(&mut workers).await;
        }

        finish_workers(&mut workers, "discovery").await;
        info!("Source loop finished");
    }

    /// Run article workers until no work is left anywhere or stop is requested.
    ///
    /// Keeps running while discovery is outstanding, since it may still feed
    /// the queue. The cap counts in-flight articles rather than live workers:
    /// a worker reaped by the stuck scan no longer owns a slot.
    #[instrument(level = "info", skip_all)]
    pub async fn run_articles(&self) {
        let cap = self.settings.max_concurrent_articles;
        let mut workers = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            loop {
                let next = {
                    let mut state = self.state.lock().await;
                    if state.in_flight_len() < cap {
                        state.next_article(Utc::now())
                    } else {
                        None
                    }
                };
                let Some(task) = next else { break };
                let this = self.clone();
                workers.spawn(async move { this.process_article(task).await });
            }

            if self.state.lock().await.is_idle() {
                break;
            }
            self.wait_for_worker(&mut workers).await;
        }

        self.finish_article_workers(&mut workers).await;
        info!("Article loop finished");
    }

    /// Wait until every queue, in-flight set and retry set is empty.
    ///
    /// Returns `false` if stop was requested first.
    pub async fn drain(&self) -> bool {
        loop {
            if self.state.lock().await.is_idle() {
                return true;
            }
            tokio::select! {
                _ = sleep(self.settings.idle_poll) => {}
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// Wait for workers that still own an in-flight slot, then abort the rest.
    ///
    /// Whatever is left once nothing is in flight was reaped as stuck; its
    /// task has already been handed to the retry path.
    async fn finish_article_workers(&self, workers: &mut JoinSet<()>) {
        if !workers.is_empty() {
            info!(kind = "article", remaining = workers.len(), "Waiting for in-flight workers");
        }
        while !workers.is_empty() {
            tokio::select! {
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        error!(kind = "article", error = %e, "Worker task aborted");
                    }
                }
                _ = sleep(self.settings.idle_poll) => {
                    if self.state.lock().await.in_flight_len() == 0 {
                        break;
                    }
                }
            }
        }

        if workers.is_empty() {
            return;
        }
        warn!(abandoned = workers.len(), "Aborting workers reaped as stuck");
        workers.abort_all();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!(kind = "article", error = %e, "Worker task aborted");
                }
            }
        }
    }

    async fn wait_for_worker(&self, workers: &mut JoinSet<()>) {
        tokio::select! {
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task aborted");
                }
            }
            _ = sleep(self.settings.idle_poll) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    #[instrument(level = "info", skip_all, fields(source = %task.id, retries = task.retries))]
    async fn discover_source(&self, task: SourceTask) {
        let source = task.id;
        let outcome = AssertUnwindSafe(self.discover_once(&source))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("unknown: discovery worker panicked".to_string()));

        match outcome {
            Ok(articles) => {
                let found = articles.len();
                let added = self.enqueue_discovered(&source, articles).await;
                self.state.lock().await.finish_source(&source);
                info!(found, added, "Discovery finished");
            }
            Err(error) => {
                let task = self.state.lock().await.take_source_in_flight(&source);
                if let Some(task) = task {
                    self.retry.handle_source_failure(task, &error).await;
                }
            }
        }
    }

    async fn discover_once(&self, source: &str) -> Result<Vec<DiscoveredArticle>, String> {
        let resource = self.pool.acquire(source).await.map_err(|e| e.to_string())?;
        let result = self.discoverer.discover(source, &resource).await;
        self.pool.mark_activity(source).await;
        self.pool.release(source).await;
        result.map_err(|e| e.to_string())
    }

    /// Dedup, cap and enqueue one discovery result. Returns how many were new.
    async fn enqueue_discovered(&self, source: &str, articles: Vec<DiscoveredArticle>) -> usize {
        let limit = self.settings.discovery_limit(source);
        let prioritized: Vec<(String, f64)> = articles
            .into_iter()
            .unique_by(|a| a.url.clone())
            .take(limit)
            .map(|a| {
                let priority = self.priority.priority(&a.url, source);
                (a.url, priority)
            })
            .collect();

        let now = Utc::now();
        let mut state = self.state.lock().await;
        prioritized
            .iter()
            .filter(|(url, priority)| state.enqueue_article(url, source, *priority, now))
            .count()
    }

    #[instrument(level = "info", skip_all, fields(url = %truncate_for_log(&task.url, 120), attempts = task.attempts))]
    async fn process_article(&self, task: ArticleTask) {
        let url = task.url;
        let admitted_at = task.last_attempt_at;
        let outcome = AssertUnwindSafe(self.processor.process(&url))
            .catch_unwind()
            .await
            .map_err(|_| "unknown: article worker panicked".to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match outcome {
            Ok(()) => {
                let fresh = self.state.lock().await.complete_article(&url);
                if fresh {
                    info!("Article processed");
                } else {
                    debug!("Article was already completed");
                }
            }
            Err(error) => {
                // Only the attempt that still owns the in-flight slot may fail it.
                let task = {
                    let mut state = self.state.lock().await;
                    let owns_slot = state
                        .in_flight
                        .get(&url)
                        .is_some_and(|t| t.last_attempt_at == admitted_at);
                    if owns_slot {
                        state.take_in_flight(&url)
                    } else {
                        None
                    }
                };
                match task {
                    Some(task) => {
                        self.retry.handle_article_failure(task, &error).await;
                    }
                    None => {
                        warn!(error = %truncate_for_log(&error, 300), "Ignoring late failure for a reaped attempt");
                    }
                }
            }
        }
    }
}

/// Let in-flight workers finish after the loop stops admitting.
async fn finish_workers(workers: &mut JoinSet<()>, kind: &str) {
    if !workers.is_empty() {
        info!(kind, remaining = workers.len(), "Waiting for in-flight workers");
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(kind, error = %e, "Worker task aborted");
        }
    }
}
