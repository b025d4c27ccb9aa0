//! Interfaces to the external collaborators the orchestrator drives.
//!
//! The orchestrator owns scheduling, retries and persistence. Everything that
//! touches the outside world goes through the traits below:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`Discoverer`] | list candidate article URLs for a source |
//! | [`ArticleProcessor`] | fetch + rewrite + persist one article |
//! | [`Diagnoser`] | classify an error text into a known problem |
//! | [`ResourceFactory`] | create/close the long-lived per-source resource |
//!
//! Collaborators never see the orchestration state; they communicate only
//! through return values.
//!
//! # Provided adapters
//!
//! - [`http`]: one `reqwest::Client` per source plus an index-page link discoverer
//! - [`command`]: runs an external rewrite command per URL
//! - [`diagnosis`]: keyword-table diagnoser

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub mod command;
pub mod diagnosis;
pub mod http;

/// A candidate article returned by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredArticle {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl DiscoveredArticle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            published_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("discovery timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("network error: {0}")]
    Network(String),

    #[error("content extraction failed: {0}")]
    ContentExtraction(String),

    #[error("rewrite failed: {0}")]
    Rewrite(String),

    #[error("{0}")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to create resource for {source_id}: {reason}")]
    Create { source_id: String, reason: String },

    #[error("failed to close resource for {source_id}: {reason}")]
    Close { source_id: String, reason: String },
}

/// Lists candidate articles for a source using that source's pooled resource.
///
/// Must be safe to call repeatedly for the same source.
#[async_trait]
pub trait Discoverer<R>: Send + Sync {
    async fn discover(
        &self,
        source: &str,
        resource: &R,
    ) -> Result<Vec<DiscoveredArticle>, DiscoveryError>;
}

/// Fetches, rewrites and persists one article.
///
/// Must be safe to call more than once for the same URL.
#[async_trait]
pub trait ArticleProcessor: Send + Sync {
    async fn process(&self, url: &str) -> Result<(), ProcessingError>;
}

/// Result of classifying an error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub recognized: bool,
    pub problem_type: String,
    pub suggested_strategy: String,
}

impl Diagnosis {
    pub fn unrecognized() -> Self {
        Self {
            recognized: false,
            problem_type: "unknown_problem".to_string(),
            suggested_strategy: "default_retry".to_string(),
        }
    }
}

/// Advisory error classifier. Pure: no side effects.
pub trait Diagnoser: Send + Sync {
    fn diagnose(&self, error_text: &str, source: &str) -> Diagnosis;
}

/// Creates and closes the long-lived resource owned by the pool for a source.
#[async_trait]
pub trait ResourceFactory<R>: Send + Sync {
    async fn create(&self, source: &str) -> Result<R, ResourceError>;

    async fn close(&self, source: &str, resource: Arc<R>) -> Result<(), ResourceError>;
}
