//! Progress and health monitoring.
//!
//! [`HealthMonitor`] does two periodic jobs:
//!
//! - **Stuck scan**: in-flight articles older than the stuck timeout are taken
//!   out of the in-flight map and handed to the retry engine as timeouts. The
//!   original worker is not cancelled; if it later succeeds, the success wins.
//! - **Progress**: a [`ProgressReport`] is logged and written to the progress
//!   feed file, which `news_relay status` reads.
//!
//! A [`FinalReport`] summarizes the run once the scheduler drains.

use crate::retry::RetryEngine;
use crate::state::{ProcessingState, SharedState};
use crate::utils::{truncate_for_log, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ProgressFeedError {
    #[error("failed to read progress feed {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse progress feed {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Point-in-time summary of counters and queue depths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub generated_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: u64,
    pub total_sources: u64,
    pub sources_queued: usize,
    pub sources_in_flight: usize,
    pub sources_retrying: usize,
    pub failed_sources: u64,
    pub total_articles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retries_scheduled: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub retrying: usize,
    /// Succeeded articles per minute since start.
    pub throughput_per_min: f64,
    /// Percentage of finished articles that succeeded.
    pub success_rate: f64,
}

impl ProgressReport {
    pub fn from_state(state: &ProcessingState, now: DateTime<Utc>) -> Self {
        let counters = state.counters();
        let elapsed = (now - counters.started_at).to_std().unwrap_or_default();
        Self {
            generated_at: now,
            started_at: counters.started_at,
            elapsed_secs: elapsed.as_secs(),
            total_sources: counters.total_sources,
            sources_queued: state.source_queue_len(),
            sources_in_flight: state.sources_in_flight_len(),
            sources_retrying: state.sources_retrying_len(),
            failed_sources: counters.failed_sources,
            total_articles: counters.total_articles,
            succeeded: counters.succeeded,
            failed: counters.failed,
            skipped: counters.skipped,
            retries_scheduled: counters.retries_scheduled,
            queued: state.article_queue_len(),
            in_flight: state.in_flight_len(),
            retrying: state.retrying_len(),
            throughput_per_min: throughput_per_min(counters.succeeded, elapsed),
            success_rate: success_rate(counters.succeeded, counters.failed),
        }
    }

    fn log(&self) {
        info!(
            succeeded = self.succeeded,
            failed = self.failed,
            skipped = self.skipped,
            queued = self.queued,
            in_flight = self.in_flight,
            retrying = self.retrying,
            sources_queued = self.sources_queued,
            sources_in_flight = self.sources_in_flight,
            elapsed_secs = self.elapsed_secs,
            throughput_per_min = %format!("{:.2}", self.throughput_per_min),
            success_rate = %format!("{:.1}%", self.success_rate),
            "Progress"
        );
    }
}

fn throughput_per_min(succeeded: u64, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if minutes > 0.0 {
        succeeded as f64 / minutes
    } else {
        0.0
    }
}

fn success_rate(succeeded: u64, failed: u64) -> f64 {
    let finished = succeeded + failed;
    if finished == 0 {
        0.0
    } else {
        succeeded as f64 * 100.0 / finished as f64
    }
}

/// Read the progress feed written by a running orchestrator.
pub async fn read_progress_feed(path: &Path) -> Result<ProgressReport, ProgressFeedError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| ProgressFeedError::Read {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_slice(&raw).map_err(|source| ProgressFeedError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// End-of-run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub progress: ProgressReport,
    pub completed_sources: Vec<String>,
    /// Failed source name to its last error.
    pub failed_sources: BTreeMap<String, String>,
    pub retries_by_source: BTreeMap<String, u64>,
}

impl FinalReport {
    pub fn from_state(state: &ProcessingState, now: DateTime<Utc>) -> Self {
        Self {
            progress: ProgressReport::from_state(state, now),
            completed_sources: state.completed_sources.iter().cloned().collect(),
            failed_sources: state
                .failed_sources
                .values()
                .map(|t| (t.id.clone(), t.last_error.clone().unwrap_or_default()))
                .collect(),
            retries_by_source: state.counters().retries_by_source.clone(),
        }
    }

    pub fn log(&self) {
        let p = &self.progress;
        info!(
            total_articles = p.total_articles,
            succeeded = p.succeeded,
            failed = p.failed,
            skipped = p.skipped,
            retries = p.retries_scheduled,
            elapsed_secs = p.elapsed_secs,
            success_rate = %format!("{:.1}%", p.success_rate),
            completed_sources = ?self.completed_sources,
            "Run complete"
        );
        for (source, retries) in &self.retries_by_source {
            info!(%source, retries, "Retries by source");
        }
        for (source, error) in &self.failed_sources {
            warn!(%source, error = %truncate_for_log(error, 300), "Source failed");
        }
    }
}

pub struct HealthMonitor {
    state: SharedState,
    retry: Arc<RetryEngine>,
    stuck_timeout: Duration,
    progress_file: PathBuf,
}

impl HealthMonitor {
    pub fn new(
        state: SharedState,
        retry: Arc<RetryEngine>,
        stuck_timeout: Duration,
        progress_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state,
            retry,
            stuck_timeout,
            progress_file: progress_file.into(),
        }
    }

    /// Route every article stuck in flight through the retry path as a timeout.
    ///
    /// Returns the number of reaped tasks.
    #[instrument(level = "debug", skip(self))]
    pub async fn scan_stuck(&self, now: DateTime<Utc>) -> usize {
        let stuck = {
            let mut state = self.state.lock().await;
            let urls = state.stuck_in_flight(now, self.stuck_timeout);
            urls.iter()
                .filter_map(|url| state.take_in_flight(url))
                .collect::<Vec<_>>()
        };

        let reason = format!(
            "timeout: in flight longer than {}s",
            self.stuck_timeout.as_secs()
        );
        for task in &stuck {
            warn!(
                url = %truncate_for_log(&task.url, 120),
                source = %task.source,
                started = ?task.last_attempt_at,
                "Article stuck in flight; handing to retry"
            );
        }
        let count = stuck.len();
        for task in stuck {
            self.retry.handle_article_failure(task, &reason).await;
        }
        count
    }

    pub async fn report_progress(&self, now: DateTime<Utc>) -> ProgressReport {
        ProgressReport::from_state(&*self.state.lock().await, now)
    }

    /// Log the progress report and write it to the feed file.
    pub async fn publish_progress(&self, now: DateTime<Utc>) -> io::Result<ProgressReport> {
        let report = self.report_progress(now).await;
        report.log();
        let bytes = serde_json::to_vec_pretty(&report)?;
        write_atomic(&self.progress_file, &bytes).await?;
        Ok(report)
    }

    pub async fn final_report(&self, now: DateTime<Utc>) -> FinalReport {
        FinalReport::from_state(&*self.state.lock().await, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::diagnosis::KeywordDiagnoser;
    use crate::model::ArticleStatus;
    use crate::retry::{BackoffTiers, RetryPolicy};
    use crate::state::ArticleLocation;
    use tokio::sync::Mutex;

    fn setup(dir: &Path) -> (HealthMonitor, SharedState) {
        let state: SharedState = Arc::new(Mutex::new(ProcessingState::new(ts(0))));
        let retry = Arc::new(RetryEngine::new(
            RetryPolicy::new(3, BackoffTiers::default()),
            Arc::clone(&state),
            Arc::new(KeywordDiagnoser),
        ));
        let monitor = HealthMonitor::new(
            Arc::clone(&state),
            retry,
            Duration::from_secs(30 * 60),
            dir.join("progress.json"),
        );
        (monitor, state)
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000 + secs, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_requeued_then_late_success_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, state) = setup(dir.path());
        let url = "https://golf.com/news/slow";
        {
            let mut s = state.lock().await;
            s.enqueue_article(url, "golf.com", 1.0, ts(0));
            s.next_article(ts(0));
        }

        assert_eq!(monitor.scan_stuck(ts(29 * 60)).await, 0);
        assert_eq!(monitor.scan_stuck(ts(31 * 60)).await, 1);
        {
            let s = state.lock().await;
            assert_eq!(s.locations(url), vec![ArticleLocation::Retrying]);
            let task = s.article(url).unwrap();
            assert_eq!(task.attempts, 1);
            assert_eq!(task.status, ArticleStatus::Recovering);
            assert!(task.last_error.as_deref().unwrap().starts_with("timeout"));
        }

        // The original worker finishes after being reaped.
        assert!(state.lock().await.complete_article(url));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let s = state.lock().await;
        assert_eq!(s.locations(url), vec![ArticleLocation::Completed]);
        assert_eq!(s.counters().succeeded, 1);
        assert_eq!(s.article_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_progress_report_and_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, state) = setup(dir.path());
        {
            let mut s = state.lock().await;
            s.enqueue_source("golf.com");
            for i in 0..4 {
                s.enqueue_article(&format!("https://golf.com/news/{i}"), "golf.com", 1.0, ts(0));
            }
            for i in 0..3 {
                s.next_article(ts(1));
                s.complete_article(&format!("https://golf.com/news/{i}"));
            }
            let task = s.next_article(ts(2)).unwrap();
            s.take_in_flight(&task.url);
            s.fail_article(task);
            s.enqueue_article("https://golf.com/news/0", "golf.com", 1.0, ts(3));
        }

        let report = monitor.publish_progress(ts(120)).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sources_queued, 1);
        assert_eq!(report.elapsed_secs, 120);
        assert!((report.throughput_per_min - 1.5).abs() < 1e-9);
        assert!((report.success_rate - 75.0).abs() < 1e-9);

        let feed = read_progress_feed(&dir.path().join("progress.json")).await.unwrap();
        assert_eq!(feed, report);
    }

    #[tokio::test]
    async fn test_missing_feed_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_progress_feed(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, ProgressFeedError::Read { .. }));
    }

    #[test]
    fn test_rates_with_nothing_finished() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(throughput_per_min(5, Duration::ZERO), 0.0);
    }

    #[tokio::test]
    async fn test_final_report_lists_sources_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, state) = setup(dir.path());
        {
            let mut s = state.lock().await;
            s.enqueue_source("golf.com");
            s.enqueue_source("mygolfspy.com");
            s.next_source();
            s.finish_source("golf.com");
            let mut failed = s.next_source().unwrap();
            s.take_source_in_flight(&failed.id);
            failed.last_error = Some("HTTP 403 Forbidden".to_string());
            s.fail_source(failed);
            s.counters.record_retry("mygolfspy.com");
        }
        let report = monitor.final_report(ts(60)).await;
        assert_eq!(report.completed_sources, vec!["golf.com"]);
        assert_eq!(report.failed_sources["mygolfspy.com"], "HTTP 403 Forbidden");
        assert_eq!(report.retries_by_source["mygolfspy.com"], 1);
    }
}
