//! Keyword-table error diagnoser.
//!
//! Matches lowercase error text against a fixed table of known problems. Each
//! rule scores the fraction of its keywords found in the text; the best score
//! wins and ties go to the earlier rule. A zero score is not recognized.

use super::{Diagnoser, Diagnosis};
use tracing::debug;

struct Rule {
    problem_type: &'static str,
    suggested_strategy: &'static str,
    keywords: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        problem_type: "bot_protection",
        suggested_strategy: "browser_challenge",
        keywords: &["cloudflare", "just a moment"],
    },
    Rule {
        problem_type: "access_denied",
        suggested_strategy: "alternate_feed",
        keywords: &["403", "forbidden"],
    },
    Rule {
        problem_type: "content_extraction",
        suggested_strategy: "specialized_scraper",
        keywords: &["empty content", "extraction failed"],
    },
    Rule {
        problem_type: "not_found",
        suggested_strategy: "find_alternative_url",
        keywords: &["404", "not found"],
    },
    Rule {
        problem_type: "timeout",
        suggested_strategy: "extend_timeout",
        keywords: &["timeout", "timed out"],
    },
];

/// Diagnoser backed by a static keyword table.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordDiagnoser;

impl KeywordDiagnoser {
    /// Fraction of a rule's keywords found in `text`.
    fn score(rule: &Rule, text: &str) -> f64 {
        let hits = rule.keywords.iter().filter(|k| text.contains(*k)).count();
        hits as f64 / rule.keywords.len() as f64
    }
}

impl Diagnoser for KeywordDiagnoser {
    fn diagnose(&self, error_text: &str, source: &str) -> Diagnosis {
        let text = error_text.to_lowercase();
        let mut best: Option<(&Rule, f64)> = None;
        for rule in RULES {
            let score = Self::score(rule, &text);
            if score > best.map_or(0.0, |(_, s)| s) {
                best = Some((rule, score));
            }
        }

        match best {
            Some((rule, score)) => {
                debug!(source, problem = rule.problem_type, score, "Matched known problem");
                Diagnosis {
                    recognized: true,
                    problem_type: rule.problem_type.to_string(),
                    suggested_strategy: rule.suggested_strategy.to_string(),
                }
            }
            None => Diagnosis::unrecognized(),
        }
    }
}
