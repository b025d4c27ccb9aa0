//! Task records tracked by the orchestrator.
//!
//! Two kinds of work flow through the scheduler:
//! - [`SourceTask`]: one discovery pass over a news source
//! - [`ArticleTask`]: fetch + rewrite + persist of one article URL
//!
//! Both are plain serde records so they can be written into snapshots as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of a discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Queued,
    Discovering,
    Completed,
    Failed,
}

/// Lifecycle of an article.
///
/// `Recovering` marks a task that failed and is waiting out its backoff
/// delay before it re-enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    Queued,
    Processing,
    Recovering,
    Succeeded,
    Failed,
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArticleStatus::Queued => "queued",
            ArticleStatus::Processing => "processing",
            ArticleStatus::Recovering => "recovering",
            ArticleStatus::Succeeded => "succeeded",
            ArticleStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A news source waiting for (or undergoing) discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTask {
    /// Source name, e.g. `"golf.com"`.
    pub id: String,
    pub status: SourceStatus,
    /// Failed discovery passes so far.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SourceTask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SourceStatus::Queued,
            retries: 0,
            last_error: None,
        }
    }
}

/// One article URL moving through processing.
///
/// The URL is the identity of the task: the orchestrator never tracks two
/// tasks with the same URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleTask {
    pub url: String,
    /// Name of the source that discovered this URL.
    pub source: String,
    pub status: ArticleStatus,
    /// Processing attempts that ended in failure. Never decreases.
    #[serde(default)]
    pub attempts: u32,
    /// Scheduling priority; higher runs sooner.
    pub priority: f64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ArticleTask {
    pub fn new(
        url: impl Into<String>,
        source: impl Into<String>,
        priority: f64,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            status: ArticleStatus::Queued,
            attempts: 0,
            priority,
            enqueued_at,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

/// Aggregate counters carried across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub total_sources: u64,
    #[serde(default)]
    pub total_articles: u64,
    #[serde(default)]
    pub succeeded: u64,
    #[serde(default)]
    pub failed: u64,
    /// Discovered URLs dropped because they were already completed or tracked.
    #[serde(default)]
    pub skipped: u64,
    /// Backoff re-enqueues scheduled (articles and sources).
    #[serde(default)]
    pub retries_scheduled: u64,
    #[serde(default)]
    pub failed_sources: u64,
    /// Retries scheduled per source name, for the final report.
    #[serde(default)]
    pub retries_by_source: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
}

impl Counters {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            total_sources: 0,
            total_articles: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            retries_scheduled: 0,
            failed_sources: 0,
            retries_by_source: BTreeMap::new(),
            started_at,
        }
    }

    pub fn record_retry(&mut self, source: &str) {
        self.retries_scheduled += 1;
        *self.retries_by_source.entry(source.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_task_starts_queued() {
        let task = ArticleTask::new("https://golf.com/news/a", "golf.com", 1.5, Utc::now());
        assert_eq!(task.status, ArticleStatus::Queued);
        assert_eq!(task.attempts, 0);
        assert!(task.last_attempt_at.is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ArticleStatus::Recovering).unwrap();
        assert_eq!(json, "\"recovering\"");
        let json = serde_json::to_string(&SourceStatus::Discovering).unwrap();
        assert_eq!(json, "\"discovering\"");
    }

    #[test]
    fn test_record_retry_tracks_per_source() {
        let mut counters = Counters::new(Utc::now());
        counters.record_retry("golf.com");
        counters.record_retry("golf.com");
        counters.record_retry("mygolfspy.com");
        assert_eq!(counters.retries_scheduled, 3);
        assert_eq!(counters.retries_by_source["golf.com"], 2);
    }

    #[test]
    fn test_article_task_tolerates_missing_optional_fields() {
        let json = r#"{
            "url": "https://golf.com/news/a",
            "source": "golf.com",
            "status": "queued",
            "priority": 1.2,
            "enqueued_at": "2025-07-20T10:00:00Z",
            "some_future_field": true
        }"#;
        let task: ArticleTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.attempts, 0);
        assert!(task.last_error.is_none());
    }
}
