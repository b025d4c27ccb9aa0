//! Snapshots of the processing state and restore on startup.
//!
//! A snapshot is a JSON document holding everything needed to resume after a
//! crash or a planned restart. Work that was in flight or backing off when the
//! snapshot was taken is written back as queued: the collaborators are
//! idempotent, so re-running an attempt is safe, losing it is not.
//!
//! # Restore rules
//!
//! | File | Result |
//! |------|--------|
//! | missing | cold start |
//! | older than the freshness window | discarded, cold start |
//! | unreadable or corrupt | [`SnapshotError`], fatal |
//! | otherwise | state rehydrated |
//!
//! The format is forward compatible: unknown fields are ignored and absent
//! collections default to empty.

use crate::model::{ArticleTask, Counters, SourceStatus, SourceTask};
use crate::state::ProcessingState;
use crate::utils::{looks_truncated, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("snapshot {path} is corrupt (truncated: {truncated}): {source}")]
    Corrupt {
        path: String,
        truncated: bool,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub source_queue: Vec<SourceTask>,
    /// Articles still to process, in admission order.
    #[serde(default)]
    pub articles: Vec<ArticleTask>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub permanently_failed: Vec<ArticleTask>,
    #[serde(default)]
    pub failed_sources: Vec<SourceTask>,
    #[serde(default)]
    pub completed_sources: Vec<String>,
    #[serde(default)]
    pub failure_counts: BTreeMap<String, u32>,
    pub counters: Counters,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Snapshot {
    /// Copy the state into a snapshot.
    pub fn capture(state: &ProcessingState, now: DateTime<Utc>) -> Self {
        let mut source_queue: Vec<SourceTask> = state.source_queue.iter().cloned().collect();
        let mut pending_sources: Vec<SourceTask> = state
            .sources_in_flight
            .values()
            .chain(state.sources_retrying.values())
            .cloned()
            .collect();
        pending_sources.sort_by(|a, b| a.id.cmp(&b.id));
        source_queue.extend(pending_sources);
        for task in &mut source_queue {
            task.status = SourceStatus::Queued;
        }

        let mut articles: Vec<ArticleTask> =
            state.queued_articles().into_iter().cloned().collect();
        let mut pending: Vec<ArticleTask> = state
            .in_flight
            .values()
            .chain(state.retrying.values())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.url.cmp(&b.url));
        articles.extend(pending);

        let mut completed: Vec<String> = state.completed.iter().cloned().collect();
        completed.sort();
        let mut permanently_failed: Vec<ArticleTask> =
            state.permanently_failed.values().cloned().collect();
        permanently_failed.sort_by(|a, b| a.url.cmp(&b.url));
        let mut failed_sources: Vec<SourceTask> = state.failed_sources.values().cloned().collect();
        failed_sources.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            version: SNAPSHOT_VERSION,
            taken_at: now,
            source_queue,
            articles,
            completed,
            permanently_failed,
            failed_sources,
            completed_sources: state.completed_sources.iter().cloned().collect(),
            failure_counts: state
                .failure_counts
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            counters: state.counters.clone(),
        }
    }

    /// Rebuild a live state from the snapshot.
    ///
    /// Every article comes back queued. An article that also appears in the
    /// completed set is dropped.
    pub fn into_state(self) -> ProcessingState {
        let mut state = ProcessingState::new(self.counters.started_at);
        state.counters = self.counters;
        state.completed = self.completed.into_iter().collect();

        for mut task in self.source_queue {
            if state.source_queue.iter().any(|s| s.id == task.id) {
                continue;
            }
            task.status = SourceStatus::Queued;
            state.source_queue.push_back(task);
        }
        for task in self.permanently_failed {
            state.permanently_failed.insert(task.url.clone(), task);
        }
        for task in self.articles {
            if state.completed.contains(&task.url) || state.is_tracked(&task.url) {
                continue;
            }
            state.push_queued(task);
        }
        for task in self.failed_sources {
            state.failed_sources.insert(task.id.clone(), task);
        }
        state.completed_sources = self.completed_sources.into_iter().collect();
        state.failure_counts = self.failure_counts.into_iter().collect();
        state
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.taken_at).to_std().unwrap_or_default()
    }
}

/// Reads and writes the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    freshness: Duration,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            path: path.into(),
            freshness,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically. A failed write leaves the previous
    /// snapshot in place.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| SnapshotError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        info!(
            queued = snapshot.articles.len(),
            completed = snapshot.completed.len(),
            failed = snapshot.permanently_failed.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    /// Load the snapshot if one exists and is fresh enough.
    pub async fn restore(&self) -> Result<Option<ProcessingState>, SnapshotError> {
        self.restore_at(Utc::now()).await
    }

    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub(crate) async fn restore_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingState>, SnapshotError> {
        let Some(snapshot) = self.load().await? else {
            info!("No snapshot found; starting cold");
            return Ok(None);
        };

        let age = snapshot.age(now);
        if age > self.freshness {
            warn!(
                age_secs = age.as_secs(),
                freshness_secs = self.freshness.as_secs(),
                "Snapshot is stale; discarding and starting cold"
            );
            return Ok(None);
        }

        info!(
            version = snapshot.version,
            taken_at = %snapshot.taken_at,
            queued = snapshot.articles.len(),
            completed = snapshot.completed.len(),
            "Restoring from snapshot"
        );
        Ok(Some(snapshot.into_state()))
    }

    /// Read the snapshot file without applying the freshness window.
    pub async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SnapshotError::Corrupt {
                path: self.path.display().to_string(),
                truncated: looks_truncated(&source),
                source,
            })
    }
}
