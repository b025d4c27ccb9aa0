//! The process-wide orchestration state.
//!
//! [`ProcessingState`] owns every queue, set and counter the scheduler works
//! with. It is a plain value with synchronous methods; callers share it as
//! `Arc<tokio::sync::Mutex<ProcessingState>>` and never hold the lock across a
//! collaborator call, so each method below is one atomic state transition.
//!
//! # Where a URL can live
//!
//! ```text
//! enqueue ─► queue ─► in_flight ─► completed
//!              ▲          │
//!              │          ▼ failure
//!              └──── retrying ──► permanently_failed (attempts exhausted)
//! ```
//!
//! A URL is in at most one of these places at any time.

use crate::model::{ArticleStatus, ArticleTask, Counters, SourceStatus, SourceTask};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The state as shared between the scheduler, retry engine and monitor.
pub type SharedState = Arc<Mutex<ProcessingState>>;

/// Heap entry ordering articles by priority, then age, then insertion order.
#[derive(Debug, Clone)]
pub(crate) struct QueuedArticle {
    pub(crate) task: ArticleTask,
    seq: u64,
}

impl PartialEq for QueuedArticle {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedArticle {}

impl PartialOrd for QueuedArticle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedArticle {
    // Max-heap: "greater" pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .total_cmp(&other.task.priority)
            .then_with(|| other.task.enqueued_at.cmp(&self.task.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Where a URL currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleLocation {
    Queued,
    InFlight,
    Retrying,
    Completed,
    PermanentlyFailed,
}

#[derive(Debug)]
pub struct ProcessingState {
    pub(crate) source_queue: VecDeque<SourceTask>,
    pub(crate) sources_in_flight: HashMap<String, SourceTask>,
    pub(crate) sources_retrying: HashMap<String, SourceTask>,
    pub(crate) failed_sources: HashMap<String, SourceTask>,
    pub(crate) completed_sources: BTreeSet<String>,
    pub(crate) article_queue: BinaryHeap<QueuedArticle>,
    queued_urls: HashSet<String>,
    pub(crate) in_flight: HashMap<String, ArticleTask>,
    pub(crate) retrying: HashMap<String, ArticleTask>,
    pub(crate) completed: HashSet<String>,
    pub(crate) permanently_failed: HashMap<String, ArticleTask>,
    /// URL -> consecutive failures. Diagnostic only, never used for admission.
    pub(crate) failure_counts: HashMap<String, u32>,
    pub(crate) counters: Counters,
    next_seq: u64,
}

impl ProcessingState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            source_queue: VecDeque::new(),
            sources_in_flight: HashMap::new(),
            sources_retrying: HashMap::new(),
            failed_sources: HashMap::new(),
            completed_sources: BTreeSet::new(),
            article_queue: BinaryHeap::new(),
            queued_urls: HashSet::new(),
            in_flight: HashMap::new(),
            retrying: HashMap::new(),
            completed: HashSet::new(),
            permanently_failed: HashMap::new(),
            failure_counts: HashMap::new(),
            counters: Counters::new(started_at),
            next_seq: 0,
        }
    }

    // ---- sources ----

    /// Append a source to the discovery queue.
    ///
    /// Returns `false` when the source is already queued, in flight, or
    /// waiting for a retry. A source that already finished (or failed) in an
    /// earlier run is discovered again but not counted twice.
    pub fn enqueue_source(&mut self, id: &str) -> bool {
        if self.source_is_tracked(id) {
            return false;
        }
        let seen = self.completed_sources.contains(id) || self.failed_sources.contains_key(id);
        self.source_queue.push_back(SourceTask::new(id));
        if !seen {
            self.counters.total_sources += 1;
        }
        true
    }

    fn source_is_tracked(&self, id: &str) -> bool {
        self.sources_in_flight.contains_key(id)
            || self.sources_retrying.contains_key(id)
            || self.source_queue.iter().any(|s| s.id == id)
    }

    /// Pop the next source and mark it as discovering.
    pub fn next_source(&mut self) -> Option<SourceTask> {
        let mut task = self.source_queue.pop_front()?;
        task.status = SourceStatus::Discovering;
        self.sources_in_flight.insert(task.id.clone(), task.clone());
        Some(task)
    }

    /// Discovery for `id` finished; stop tracking it.
    pub fn finish_source(&mut self, id: &str) {
        if self.sources_in_flight.remove(id).is_some() {
            if self.failed_sources.remove(id).is_some() {
                self.counters.failed_sources = self.counters.failed_sources.saturating_sub(1);
            }
            self.completed_sources.insert(id.to_string());
        }
    }

    pub fn take_source_in_flight(&mut self, id: &str) -> Option<SourceTask> {
        self.sources_in_flight.remove(id)
    }

    pub(crate) fn park_source_retry(&mut self, task: SourceTask) {
        self.sources_retrying.insert(task.id.clone(), task);
    }

    /// Move a source from the retry set back to the tail of the queue.
    pub fn requeue_source(&mut self, id: &str) -> bool {
        match self.sources_retrying.remove(id) {
            Some(mut task) => {
                task.status = SourceStatus::Queued;
                self.source_queue.push_back(task);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_source(&mut self, mut task: SourceTask) {
        task.status = SourceStatus::Failed;
        self.completed_sources.remove(&task.id);
        // A source failing again replaces its record.
        if self.failed_sources.insert(task.id.clone(), task).is_none() {
            self.counters.failed_sources += 1;
        }
    }

    // ---- articles ----

    /// Is the URL queued, in flight, retrying, or permanently failed?
    pub fn is_tracked(&self, url: &str) -> bool {
        self.queued_urls.contains(url)
            || self.in_flight.contains_key(url)
            || self.retrying.contains_key(url)
            || self.permanently_failed.contains_key(url)
    }

    /// Insert a newly discovered article.
    ///
    /// No-op (counted as skipped) when the URL already succeeded or is
    /// tracked anywhere else.
    pub fn enqueue_article(
        &mut self,
        url: &str,
        source: &str,
        priority: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if self.completed.contains(url) || self.is_tracked(url) {
            self.counters.skipped += 1;
            return false;
        }
        self.push_queued(ArticleTask::new(url, source, priority, now));
        self.counters.total_articles += 1;
        true
    }

    /// Push a task onto the heap without touching counters.
    pub(crate) fn push_queued(&mut self, mut task: ArticleTask) {
        task.status = ArticleStatus::Queued;
        self.queued_urls.insert(task.url.clone());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.article_queue.push(QueuedArticle { task, seq });
    }

    /// Admit the highest-priority article into the in-flight map.
    ///
    /// URLs that completed while they sat in the queue are dropped here
    /// rather than processed twice.
    pub fn next_article(&mut self, now: DateTime<Utc>) -> Option<ArticleTask> {
        while let Some(QueuedArticle { mut task, .. }) = self.article_queue.pop() {
            self.queued_urls.remove(&task.url);
            if self.completed.contains(&task.url) {
                continue;
            }
            task.status = ArticleStatus::Processing;
            task.last_attempt_at = Some(now);
            self.in_flight.insert(task.url.clone(), task.clone());
            return Some(task);
        }
        None
    }

    /// Record a successful article.
    ///
    /// The URL is removed from wherever it is tracked, since a worker reaped
    /// by the stuck scan can still report success afterwards. Returns `false`
    /// if the URL had already been completed.
    pub fn complete_article(&mut self, url: &str) -> bool {
        if self.completed.contains(url) {
            return false;
        }
        self.in_flight.remove(url);
        self.retrying.remove(url);
        if self.queued_urls.remove(url) {
            self.article_queue.retain(|q| q.task.url != url);
        }
        // Success is final: a late result from a reaped attempt overrides an
        // exhausted retry budget and the failure is taken back.
        if self.permanently_failed.remove(url).is_some() {
            self.counters.failed = self.counters.failed.saturating_sub(1);
        }
        self.failure_counts.remove(url);
        self.completed.insert(url.to_string());
        self.counters.succeeded += 1;
        true
    }

    pub fn take_in_flight(&mut self, url: &str) -> Option<ArticleTask> {
        self.in_flight.remove(url)
    }

    /// Bump the diagnostic failure counter for `url`.
    pub(crate) fn record_failure(&mut self, url: &str) -> u32 {
        let count = self.failure_counts.entry(url.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn park_article_retry(&mut self, mut task: ArticleTask) {
        task.status = ArticleStatus::Recovering;
        self.retrying.insert(task.url.clone(), task);
    }

    /// Move a backed-off article back into the queue.
    ///
    /// Returns `false` when the task is no longer waiting (it completed late,
    /// or the state was replaced).
    pub fn requeue_article(&mut self, url: &str, now: DateTime<Utc>) -> bool {
        match self.retrying.remove(url) {
            Some(mut task) => {
                task.enqueued_at = now;
                self.push_queued(task);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_article(&mut self, mut task: ArticleTask) {
        task.status = ArticleStatus::Failed;
        self.counters.failed += 1;
        self.permanently_failed.insert(task.url.clone(), task);
    }

    /// URLs that have been in flight longer than `timeout`.
    pub fn stuck_in_flight(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.in_flight
            .values()
            .filter(|t| t.last_attempt_at.is_some_and(|at| now - at > timeout))
            .map(|t| t.url.clone())
            .collect()
    }

    // ---- views ----

    /// Queued articles in the order they will be admitted.
    pub fn queued_articles(&self) -> Vec<&ArticleTask> {
        let mut entries: Vec<&QueuedArticle> = self.article_queue.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|q| &q.task).collect()
    }

    pub fn locate(&self, url: &str) -> Option<ArticleLocation> {
        self.locations(url).into_iter().next()
    }

    /// Every place `url` is found. More than one entry is an invariant breach.
    pub fn locations(&self, url: &str) -> Vec<ArticleLocation> {
        let mut found = Vec::new();
        if self.queued_urls.contains(url) {
            found.push(ArticleLocation::Queued);
        }
        if self.in_flight.contains_key(url) {
            found.push(ArticleLocation::InFlight);
        }
        if self.retrying.contains_key(url) {
            found.push(ArticleLocation::Retrying);
        }
        if self.completed.contains(url) {
            found.push(ArticleLocation::Completed);
        }
        if self.permanently_failed.contains_key(url) {
            found.push(ArticleLocation::PermanentlyFailed);
        }
        found
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn article(&self, url: &str) -> Option<&ArticleTask> {
        self.in_flight
            .get(url)
            .or_else(|| self.retrying.get(url))
            .or_else(|| self.permanently_failed.get(url))
            .or_else(|| {
                self.article_queue
                    .iter()
                    .find(|q| q.task.url == url)
                    .map(|q| &q.task)
            })
    }

    pub fn failure_count(&self, url: &str) -> u32 {
        self.failure_counts.get(url).copied().unwrap_or(0)
    }

    pub fn article_queue_len(&self) -> usize {
        self.article_queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retrying_len(&self) -> usize {
        self.retrying.len()
    }

    pub fn source_queue_len(&self) -> usize {
        self.source_queue.len()
    }

    pub fn sources_in_flight_len(&self) -> usize {
        self.sources_in_flight.len()
    }

    pub fn sources_retrying_len(&self) -> usize {
        self.sources_retrying.len()
    }

    /// No discovery work queued, running, or waiting for a retry.
    pub fn sources_idle(&self) -> bool {
        self.source_queue.is_empty()
            && self.sources_in_flight.is_empty()
            && self.sources_retrying.is_empty()
    }

    /// No article work queued, running, or waiting for a retry.
    pub fn articles_idle(&self) -> bool {
        self.article_queue.is_empty() && self.in_flight.is_empty() && self.retrying.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.sources_idle() && self.articles_idle()
    }
}
