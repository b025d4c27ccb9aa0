//! Retry and backoff engine.
//!
//! Decides the fate of every failed task. Failures are never fatal to the
//! scheduler: each one either schedules a deferred re-enqueue or marks the task
//! permanently failed.
//!
//! # Backoff Strategy
//!
//! Delays come from a progressive tier table indexed by `attempts - 1` and
//! clamped to the last tier:
//! ```text
//! attempt 1 -> 1 min, attempt 2 -> 2 min, attempt 3+ -> 5 min
//! ```
//! An optional random jitter (`0..=retry_jitter_ms`) is added on top.
//!
//! While it waits, a task sits in the state's retry set with status
//! `recovering`, so rediscovery of the same URL is a no-op and snapshots still
//! carry it.

use crate::collaborators::{Diagnoser, Diagnosis};
use crate::config::OrchestratorConfig;
use crate::model::{ArticleTask, SourceStatus, SourceTask};
use crate::state::SharedState;
use crate::utils::truncate_for_log;
use chrono::Utc;
use rand::{Rng, rng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Progressive delay table.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffTiers {
    delays: Vec<Duration>,
    jitter_ms: u64,
}

impl BackoffTiers {
    /// # Arguments
    ///
    /// * `delays` - Tier delays; an empty table means "retry immediately"
    /// * `jitter_ms` - Upper bound of random jitter added to each delay
    pub fn new(delays: Vec<Duration>, jitter_ms: u64) -> Self {
        Self { delays, jitter_ms }
    }

    /// Delay before the re-enqueue that follows failure number `attempts`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let index = (attempts.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        let base = self.delays.get(index).copied().unwrap_or_default();
        if self.jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rng().random_range(0..=self.jitter_ms))
    }
}

impl Default for BackoffTiers {
    fn default() -> Self {
        Self::new(
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            0,
        )
    }
}

/// What happens to a task after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay`.
    Retry { delay: Duration, attempt: u32 },
    /// Attempts exhausted; the task is permanently failed.
    GiveUp { attempts: u32 },
}

/// Pure attempt-cap policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub tiers: BackoffTiers,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, tiers: BackoffTiers) -> Self {
        Self { max_retries, tiers }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.max_retries,
            BackoffTiers::new(config.retry_delays(), config.retry_jitter_ms),
        )
    }

    /// Decide given the attempt count *after* the failure was counted.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts < self.max_retries {
            RetryDecision::Retry {
                delay: self.tiers.delay_for(attempts),
                attempt: attempts,
            }
        } else {
            RetryDecision::GiveUp { attempts }
        }
    }
}

/// The decision taken for one failure, plus the advisory diagnosis if one
/// was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub decision: RetryDecision,
    pub diagnosis: Option<Diagnosis>,
}

/// Applies [`RetryPolicy`] decisions to the shared state.
pub struct RetryEngine {
    policy: RetryPolicy,
    state: SharedState,
    diagnoser: Arc<dyn Diagnoser>,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, state: SharedState, diagnoser: Arc<dyn Diagnoser>) -> Self {
        Self {
            policy,
            state,
            diagnoser,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handle a failed article that is no longer in flight.
    ///
    /// Increments `attempts` and the URL's failure counter, then either parks
    /// the task and schedules a deferred re-enqueue, or marks it permanently
    /// failed.
    ///
    /// # Arguments
    ///
    /// * `task` - The task, already removed from the in-flight map
    /// * `error` - Failure description, kept as the task's `last_error`
    #[instrument(level = "debug", skip_all, fields(url = %task.url))]
    pub async fn handle_article_failure(&self, mut task: ArticleTask, error: &str) -> FailureOutcome {
        task.attempts += 1;
        task.last_error = Some(error.to_string());
        let decision = self.policy.decide(task.attempts);

        let failures = {
            let mut state = self.state.lock().await;
            let failures = state.record_failure(&task.url);
            match &decision {
                RetryDecision::Retry { .. } => {
                    state.park_article_retry(task.clone());
                    state.counters.record_retry(&task.source);
                }
                RetryDecision::GiveUp { .. } => state.fail_article(task.clone()),
            }
            failures
        };

        match decision {
            RetryDecision::Retry { delay, attempt } => {
                let diagnosis = self.consult(error, &task.source);
                warn!(
                    url = %truncate_for_log(&task.url, 120),
                    source = %task.source,
                    attempt,
                    max = self.policy.max_retries,
                    failures,
                    ?delay,
                    problem = %diagnosis.problem_type,
                    strategy = %diagnosis.suggested_strategy,
                    error = %truncate_for_log(error, 300),
                    "Article failed; backing off"
                );
                self.schedule_article_requeue(task.url.clone(), delay);
                FailureOutcome {
                    decision,
                    diagnosis: Some(diagnosis),
                }
            }
            RetryDecision::GiveUp { attempts } => {
                error!(
                    url = %truncate_for_log(&task.url, 120),
                    source = %task.source,
                    attempts,
                    error = %truncate_for_log(error, 300),
                    "Article exhausted retries; marked permanently failed"
                );
                FailureOutcome {
                    decision,
                    diagnosis: None,
                }
            }
        }
    }

    /// Handle a failed discovery pass that is no longer in flight.
    #[instrument(level = "debug", skip_all, fields(source = %task.id))]
    pub async fn handle_source_failure(&self, mut task: SourceTask, error: &str) -> FailureOutcome {
        task.retries += 1;
        task.last_error = Some(error.to_string());
        let decision = self.policy.decide(task.retries);

        {
            let mut state = self.state.lock().await;
            match &decision {
                RetryDecision::Retry { .. } => {
                    task.status = SourceStatus::Queued;
                    state.park_source_retry(task.clone());
                    state.counters.record_retry(&task.id);
                }
                RetryDecision::GiveUp { .. } => state.fail_source(task.clone()),
            }
        }

        match decision {
            RetryDecision::Retry { delay, attempt } => {
                let diagnosis = self.consult(error, &task.id);
                warn!(
                    source = %task.id,
                    attempt,
                    max = self.policy.max_retries,
                    ?delay,
                    problem = %diagnosis.problem_type,
                    strategy = %diagnosis.suggested_strategy,
                    error = %truncate_for_log(error, 300),
                    "Discovery failed; backing off"
                );
                self.schedule_source_requeue(task.id.clone(), delay);
                FailureOutcome {
                    decision,
                    diagnosis: Some(diagnosis),
                }
            }
            RetryDecision::GiveUp { attempts } => {
                error!(
                    source = %task.id,
                    attempts,
                    error = %truncate_for_log(error, 300),
                    "Discovery exhausted retries; source marked failed"
                );
                FailureOutcome {
                    decision,
                    diagnosis: None,
                }
            }
        }
    }

    fn consult(&self, error: &str, source: &str) -> Diagnosis {
        let diagnosis = self.diagnoser.diagnose(error, source);
        if diagnosis.recognized {
            info!(
                source,
                problem = %diagnosis.problem_type,
                strategy = %diagnosis.suggested_strategy,
                "Diagnosis suggests a strategy"
            );
        } else {
            debug!(source, "Diagnosis did not recognize the error");
        }
        diagnosis
    }

    fn schedule_article_requeue(&self, url: String, delay: Duration) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            sleep(delay).await;
            let requeued = state.lock().await.requeue_article(&url, Utc::now());
            if requeued {
                debug!(url = %truncate_for_log(&url, 120), "Article re-enqueued after backoff");
            }
        });
    }

    fn schedule_source_requeue(&self, source: String, delay: Duration) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            sleep(delay).await;
            if state.lock().await.requeue_source(&source) {
                debug!(%source, "Source re-enqueued after backoff");
            }
        });
    }
}
