//! Pattern matching against canonical error text.
//!
//! Patterns are compiled once per run. Matching is case-insensitive for all
//! three match types and the first pattern in priority order wins.

use regex::{Regex, RegexBuilder};

use crate::db::models::{ErrorPattern, MatchType};

/// Upper bound on compiled regex size for operator-authored patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

enum Compiled {
    Exact(String),
    Substring(String),
    Regex(Regex),
    /// Regex that failed to compile. Never matches.
    Invalid,
}

pub struct PatternSet {
    entries: Vec<(ErrorPattern, Compiled)>,
}

impl PatternSet {
    /// Compile `patterns`, preserving their order.
    pub fn new(patterns: Vec<ErrorPattern>) -> Self {
        let entries = patterns
            .into_iter()
            .map(|p| {
                let compiled = compile(&p);
                (p, compiled)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First pattern matching `text`, in the order the set was built with.
    pub fn first_match(&self, text: &str) -> Option<&ErrorPattern> {
        let lowered = text.to_lowercase();
        self.entries
            .iter()
            .find(|(_, compiled)| matches(compiled, text, &lowered))
            .map(|(p, _)| p)
    }
}

fn compile(pattern: &ErrorPattern) -> Compiled {
    match pattern.match_type {
        MatchType::Exact => Compiled::Exact(pattern.pattern.to_lowercase()),
        MatchType::Substring => Compiled::Substring(pattern.pattern.to_lowercase()),
        MatchType::Regex => match RegexBuilder::new(&pattern.pattern)
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
        {
            Ok(re) => Compiled::Regex(re),
            Err(e) => {
                tracing::warn!(
                    pattern_id = %pattern.id,
                    error = %e,
                    "Invalid regex pattern, treating as non-matching"
                );
                Compiled::Invalid
            }
        },
    }
}

fn matches(compiled: &Compiled, text: &str, lowered: &str) -> bool {
    match compiled {
        Compiled::Exact(p) => lowered == p,
        Compiled::Substring(p) => !p.is_empty() && lowered.contains(p.as_str()),
        Compiled::Regex(re) => re.is_match(text),
        Compiled::Invalid => false,
    }
}
