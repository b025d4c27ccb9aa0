//! Article priority policy.
//!
//! Priority is a pure function of `(url, source)` evaluated once, when the
//! article is enqueued. The scheduler only sees the [`PriorityPolicy`] trait,
//! so tests can swap in deterministic priorities.

use crate::config::{ContentMultiplier, OrchestratorConfig};
use std::collections::HashMap;
use url::Url;

/// Computes the scheduling priority of a discovered article.
pub trait PriorityPolicy: Send + Sync {
    fn priority(&self, url: &str, source: &str) -> f64;
}

/// Default policy: `1.0 × source weight × matching content multipliers`.
///
/// Unknown sources weigh 1.0. Every configured path segment that appears in
/// the URL path contributes its multiplier.
#[derive(Debug, Clone)]
pub struct WeightedPriority {
    source_weights: HashMap<String, f64>,
    content_multipliers: Vec<ContentMultiplier>,
}

impl WeightedPriority {
    pub fn new(
        source_weights: HashMap<String, f64>,
        content_multipliers: Vec<ContentMultiplier>,
    ) -> Self {
        Self {
            source_weights,
            content_multipliers,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let weights = config
            .sources
            .iter()
            .map(|s| (s.name.clone(), s.weight))
            .collect();
        Self::new(weights, config.content_multipliers.clone())
    }
}

impl PriorityPolicy for WeightedPriority {
    fn priority(&self, url: &str, source: &str) -> f64 {
        let mut priority = 1.0;
        priority *= self.source_weights.get(source).copied().unwrap_or(1.0);

        // Match against the path when the URL parses, so query strings and
        // hostnames cannot fake a category.
        let parsed = Url::parse(url).ok();
        let path = parsed.as_ref().map(|u| u.path()).unwrap_or(url);
        for rule in &self.content_multipliers {
            if path.contains(rule.segment.as_str()) {
                priority *= rule.multiplier;
            }
        }
        priority
    }
}

/// Same priority for every article; queue order degrades to FIFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatPriority;

impl PriorityPolicy for FlatPriority {
    fn priority(&self, _url: &str, _source: &str) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn policy() -> WeightedPriority {
        let mut config = OrchestratorConfig::default();
        config.sources = vec![
            SourceConfig::named("golf.com", 1.3),
            SourceConfig::named("mygolfspy.com", 0.9),
        ];
        WeightedPriority::from_config(&config)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_source_weight_applies() {
        let p = policy();
        assert!(close(p.priority("https://golf.com/story/a", "golf.com"), 1.3));
        assert!(close(p.priority("https://mygolfspy.com/story/a", "mygolfspy.com"), 0.9));
        assert!(close(p.priority("https://other.com/story/a", "other.com"), 1.0));
    }

    #[test]
    fn test_content_multipliers_stack() {
        let p = policy();
        assert!(close(p.priority("https://golf.com/news/a", "golf.com"), 1.3 * 1.2));
        assert!(close(
            p.priority("https://golf.com/news/equipment/driver", "golf.com"),
            1.3 * 1.2 * 1.1
        ));
    }

    #[test]
    fn test_query_string_does_not_match_segment() {
        let p = policy();
        assert!(close(
            p.priority("https://golf.com/story/a?ref=/news/", "golf.com"),
            1.3
        ));
    }

    #[test]
    fn test_flat_priority() {
        assert_eq!(FlatPriority.priority("https://golf.com/news/a", "golf.com"), 1.0);
    }
}
