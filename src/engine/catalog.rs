//! Static wiring between error categories and gateable product features,
//! plus the open-or-merge helper every incident-producing phase shares.

use crate::db::models::{Incident, NewIncident};
use crate::db::repos::remediation::incidents;
use crate::db::DbPool;
use crate::error::AppError;

/// Feature flag → error categories that should trip it.
pub const FEATURE_CIRCUIT_MAP: &[(&str, &[&str])] = &[
    ("ai_assistant", &["edge_function"]),
    ("supplements", &["database"]),
    ("protocols", &["database"]),
    ("client_store", &["validation"]),
];

/// Features gated by errors in `category`.
pub fn features_for_category(category: &str) -> Vec<&'static str> {
    FEATURE_CIRCUIT_MAP
        .iter()
        .filter(|(_, categories)| categories.contains(&category))
        .map(|(feature, _)| *feature)
        .collect()
}

/// Error categories that feed `feature`'s breaker.
pub fn categories_for_feature(feature: &str) -> &'static [&'static str] {
    FEATURE_CIRCUIT_MAP
        .iter()
        .find(|(f, _)| *f == feature)
        .map(|(_, categories)| *categories)
        .unwrap_or(&[])
}

/// How an incident producer finds its existing open incident.
pub enum DedupKey<'a> {
    /// Open incident from the same source whose pattern contains the fragment.
    Pattern(&'a str),
    /// Open incident from the same source whose metadata has `key == value`,
    /// optionally detected at or after a cutoff.
    Metadata {
        key: &'a str,
        value: &'a str,
        since: Option<&'a str>,
    },
}

/// Whether [`open_or_merge`] created a new incident or bumped an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentOutcome {
    Created,
    Merged,
}

/// Create `incident` unless an open one already matches `key`; in that case
/// merge `incident.metadata` into it and raise its severity if needed.
pub fn open_or_merge(
    pool: &DbPool,
    incident: NewIncident,
    key: DedupKey<'_>,
) -> Result<(Incident, IncidentOutcome), AppError> {
    let existing = match key {
        DedupKey::Pattern(fragment) => {
            incidents::find_open_by_pattern(pool, &incident.source, fragment)?
        }
        DedupKey::Metadata { key, value, since } => {
            incidents::find_open_by_metadata(pool, &incident.source, key, value, since)?
        }
    };

    match existing {
        Some(current) => {
            incidents::raise_severity(pool, &current.id, incident.severity)?;
            let merged = incidents::merge(pool, &current.id, incident.metadata)?;
            Ok((merged, IncidentOutcome::Merged))
        }
        None => Ok((incidents::create(pool, incident)?, IncidentOutcome::Created)),
    }
}

/// First `max` characters of `s`.
pub fn clip(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{Severity, SOURCE_SENTINEL};

    #[test]
    fn test_feature_lookup_both_directions() {
        assert_eq!(features_for_category("database"), vec!["supplements", "protocols"]);
        assert_eq!(features_for_category("edge_function"), vec!["ai_assistant"]);
        assert!(features_for_category("network").is_empty());
        assert_eq!(categories_for_feature("client_store"), &["validation"]);
        assert!(categories_for_feature("unknown").is_empty());
    }

    #[test]
    fn test_open_or_merge_dedups_by_pattern_fragment() {
        let pool = init_test_db().unwrap();
        let mut first = NewIncident::detected("[Sentinel] database: boom", Severity::Medium, SOURCE_SENTINEL);
        first.error_pattern = Some("relation does not exist".into());
        let (a, outcome) = open_or_merge(&pool, first.clone(), DedupKey::Pattern("relation does")).unwrap();
        assert_eq!(outcome, IncidentOutcome::Created);

        first.severity = Severity::High;
        let (b, outcome) = open_or_merge(&pool, first, DedupKey::Pattern("relation does")).unwrap();
        assert_eq!(outcome, IncidentOutcome::Merged);
        assert_eq!(a.id, b.id);
        assert_eq!(b.severity, Severity::High);
        assert_eq!(b.metadata["occurrences"], 2);
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), "hé");
        assert_eq!(clip("abc", 10), "abc");
    }
}
