//! Classify an error text into one of the schema error classes the healer
//! knows how to fix.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

macro_rules! pattern {
    ($re:expr) => {{
        #[allow(clippy::expect_used)]
        let re = Regex::new($re).expect("valid regex");
        re
    }};
}

// Postgres 42703 / PostgREST PGRST204
static COLUMN_OF_RELATION: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)column "?(\w+)"? of relation "?(?:public\.)?(\w+)"? does not exist"#)
});
static COLUMN_QUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)column "?(?:(\w+)\.)?(\w+)"? does not exist"#)
});
static POSTGREST_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)could not find the '(\w+)' column of '(?:public\.)?(\w+)' in the schema cache"#)
});

// Postgres 42P01 / PostgREST PGRST205
static RELATION_MISSING: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)relation "?(?:public\.)?(\w+)"? does not exist"#)
});
static POSTGREST_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)could not find the table '(?:public\.)?(\w+)' in the schema cache"#)
});

// Postgres 42883 / PostgREST PGRST202
static FUNCTION_MISSING: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)function (?:public\.)?(\w+)\([^)]*\) does not exist"#)
});
static POSTGREST_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)could not find the function (?:public\.)?(\w+)(?:\([^)]*\))? in the schema cache"#)
});

/// `PL/pgSQL function public.get_feed(uuid) line 12 at RETURN QUERY`
static PLPGSQL_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    pattern!(r#"(?i)PL/pgSQL function (?:public\.)?(\w+)\("#)
});

static CODE_COLUMN: LazyLock<Regex> = LazyLock::new(|| pattern!(r#"\b(42703|PGRST204)\b"#));
static CODE_RELATION: LazyLock<Regex> = LazyLock::new(|| pattern!(r#"\b(42P01|PGRST205)\b"#));
static CODE_FUNCTION: LazyLock<Regex> = LazyLock::new(|| pattern!(r#"\b(42883|PGRST202)\b"#));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum ErrorClass {
    MissingColumn {
        table: Option<String>,
        column: Option<String>,
    },
    MissingRelation {
        relation: Option<String>,
    },
    /// A stored function is missing, or references something that is.
    BrokenFunctionReference {
        function: Option<String>,
        relation: Option<String>,
    },
}

impl ErrorClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingColumn { .. } => "missing_column",
            Self::MissingRelation { .. } => "missing_relation",
            Self::BrokenFunctionReference { .. } => "broken_function_reference",
        }
    }
}

/// A classified error and the phrase that identified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    /// Exact text matched in the error, reused as a learned substring pattern.
    /// `None` when only an error code was recognised.
    pub phrase: Option<String>,
}

fn group(c: &Captures<'_>, i: usize) -> Option<String> {
    c.get(i).map(|m| m.as_str().to_string())
}

fn phrase(c: &Captures<'_>) -> Option<String> {
    c.get(0).map(|m| m.as_str().to_string())
}

/// Longest qualifier still treated as a query alias rather than a table.
const MAX_ALIAS_LEN: usize = 2;

/// Resolve the qualifier in `column q.col does not exist` to a table name.
/// Postgres reports the query alias here, so look for `FROM tbl q` or
/// `JOIN tbl AS q` in the text first. A short unresolved qualifier is an
/// alias and yields no table.
fn qualifier_table(text: &str, qualifier: &str) -> Option<String> {
    let binding = format!(
        r"(?i)\b(?:FROM|JOIN)\s+(?:public\.)?(\w+)\s+(?:AS\s+)?{}\b",
        regex::escape(qualifier)
    );
    if let Some(table) = Regex::new(&binding)
        .ok()
        .and_then(|re| re.captures(text))
        .and_then(|c| group(&c, 1))
    {
        return Some(table);
    }
    (qualifier.chars().count() > MAX_ALIAS_LEN).then(|| qualifier.to_string())
}

/// Classify `text`, or `None` if it is not a schema error the healer handles.
pub fn classify(text: &str) -> Option<Classification> {
    let inside_function = PLPGSQL_CONTEXT.captures(text).and_then(|c| group(&c, 1));

    if let Some(c) = COLUMN_OF_RELATION.captures(text) {
        return Some(Classification {
            class: ErrorClass::MissingColumn { table: group(&c, 2), column: group(&c, 1) },
            phrase: phrase(&c),
        });
    }
    if let Some(c) = POSTGREST_COLUMN.captures(text) {
        return Some(Classification {
            class: ErrorClass::MissingColumn { table: group(&c, 2), column: group(&c, 1) },
            phrase: phrase(&c),
        });
    }
    if let Some(c) = COLUMN_QUALIFIED.captures(text) {
        let table = c.get(1).and_then(|q| qualifier_table(text, q.as_str()));
        return Some(Classification {
            class: ErrorClass::MissingColumn { table, column: group(&c, 2) },
            phrase: phrase(&c),
        });
    }

    if let Some(c) = RELATION_MISSING.captures(text).or_else(|| POSTGREST_TABLE.captures(text)) {
        let relation = group(&c, 1);
        let class = match inside_function {
            Some(function) => ErrorClass::BrokenFunctionReference {
                function: Some(function),
                relation,
            },
            None => ErrorClass::MissingRelation { relation },
        };
        return Some(Classification { class, phrase: phrase(&c) });
    }

    if let Some(c) = FUNCTION_MISSING.captures(text).or_else(|| POSTGREST_FUNCTION.captures(text)) {
        return Some(Classification {
            class: ErrorClass::BrokenFunctionReference { function: group(&c, 1), relation: None },
            phrase: phrase(&c),
        });
    }

    // Bare error codes without a recognisable message.
    let class = if CODE_COLUMN.is_match(text) {
        ErrorClass::MissingColumn { table: None, column: None }
    } else if CODE_RELATION.is_match(text) {
        match inside_function {
            Some(function) => ErrorClass::BrokenFunctionReference {
                function: Some(function),
                relation: None,
            },
            None => ErrorClass::MissingRelation { relation: None },
        }
    } else if CODE_FUNCTION.is_match(text) {
        ErrorClass::BrokenFunctionReference { function: inside_function, relation: None }
    } else {
        return None;
    };
    Some(Classification { class, phrase: None })
}
