//! Safety gate for generated DDL.
//!
//! A statement is accepted only if, after comments are stripped, it is a
//! single statement, matches no denylist rule, and starts with one of the
//! allowlisted additive forms. The denylist is checked first, so an
//! allowlisted prefix never rescues a destructive body.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SafetyViolation {
    #[error("statement is empty")]
    Empty,
    #[error("more than one statement")]
    MultipleStatements,
    #[error("unterminated quote or comment")]
    Unterminated,
    #[error("denied: {0}")]
    Denied(&'static str),
    #[error("not an allowlisted additive change")]
    NotAllowlisted,
}

struct Rule {
    name: &'static str,
    re: Regex,
}

fn rules(specs: &[(&'static str, &str)]) -> Vec<Rule> {
    specs
        .iter()
        .map(|&(name, re)| {
            #[allow(clippy::expect_used)]
            let re = RegexBuilder::new(re)
                .case_insensitive(true)
                .build()
                .expect("valid regex");
            Rule { name, re }
        })
        .collect()
}

static DENYLIST: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("alter_drop", r#"\bALTER\s+TABLE\s+(IF\s+EXISTS\s+)?(ONLY\s+)?[\w."]+\s+DROP\b"#),
        ("alter_rename", r#"\bALTER\s+TABLE\s+(IF\s+EXISTS\s+)?(ONLY\s+)?[\w."]+\s+RENAME\b"#),
        // Every action after the first in a multi-action ALTER TABLE must be another ADD.
        (
            "alter_multi_action",
            r"\bALTER\s+TABLE\b[\s\S]*,\s*(DROP|RENAME|ALTER|DISABLE|ENABLE|NO\s+FORCE|FORCE|OWNER|SET|RESET|VALIDATE|CLUSTER|INHERIT|NO\s+INHERIT|REPLICA|ATTACH|DETACH|OF|NOT\s+OF)\b",
        ),
        ("drop", r"\bDROP\s+\w+"),
        ("truncate", r"\bTRUNCATE\b"),
        ("delete", r"\bDELETE\s+FROM\b"),
        ("insert", r"\bINSERT\s+INTO\b"),
        ("update", r#"\bUPDATE\s+(ONLY\s+)?[\w."]+\s+SET\b"#),
        ("create_table", r"\bCREATE\s+(TEMP(ORARY)?\s+|UNLOGGED\s+)?TABLE\b"),
        ("alter_type", r"\bALTER\s+COLUMN\s+[\w.\x22]+\s+(SET\s+DATA\s+)?TYPE\b"),
        ("row_security", r"\b(DISABLE|NO\s+FORCE)\s+ROW\s+LEVEL\s+SECURITY\b"),
        ("role", r"\b(ALTER|CREATE|DROP)\s+(ROLE|USER)\b"),
        ("grant_public", r"\bGRANT\b[\s\S]*\bTO\b[\s\S]*\bPUBLIC\b"),
        ("grant_anon", r"\bGRANT\b[\s\S]*\bTO\b[\s\S]*\banon\b"),
        (
            "grant_schema_wide",
            r"\bGRANT\b[\s\S]*\bON\s+ALL\s+(TABLES|SEQUENCES|FUNCTIONS|ROUTINES|PROCEDURES)\b",
        ),
        ("grant_all", r"\bGRANT\s+ALL\b"),
        // Dynamic SQL in a function body cannot be checked statically.
        (
            "dynamic_execute",
            r"\bEXECUTE\s+(\w+\s*(\(|;|\|\||\bUSING\b)|'|\$|\()",
        ),
        ("system", r"\bALTER\s+(SYSTEM|DATABASE)\b"),
        ("security_definer", r"\bSECURITY\s+DEFINER\b"),
        ("copy", r"\bCOPY\b"),
        ("auth_schema", r#"\b"?auth"?\.\w+"#),
        ("storage_schema", r#"\b"?storage"?\.\w+"#),
        ("pg_catalog", r"\bpg_catalog\b"),
        ("pg_authid", r"\bpg_authid\b"),
    ])
});

static ALLOWLIST: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("add_column", r#"^ALTER\s+TABLE\s+(IF\s+EXISTS\s+)?(ONLY\s+)?[\w."]+\s+ADD\s+COLUMN\b"#),
        ("add_constraint", r#"^ALTER\s+TABLE\s+(IF\s+EXISTS\s+)?(ONLY\s+)?[\w."]+\s+ADD\s+CONSTRAINT\b"#),
        ("replace_function", r"^CREATE\s+OR\s+REPLACE\s+FUNCTION\b"),
        ("create_index", r"^CREATE\s+(UNIQUE\s+)?INDEX\b"),
        ("grant", r"^GRANT\s+(SELECT|INSERT|UPDATE|EXECUTE)\b"),
        ("comment", r"^COMMENT\s+ON\b"),
    ])
});

/// Lexer state while scanning SQL text.
enum Scan {
    Code,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment(usize),
    Dollar(String),
}

/// Strip comments and report top-level statement separators.
///
/// Returns the text with comments replaced by a space, and the byte offsets
/// (in the returned text) of every `;` outside quotes and dollar-quoted bodies.
fn scan(sql: &str) -> Result<(String, Vec<usize>), SafetyViolation> {
    let mut out = String::with_capacity(sql.len());
    let mut separators = Vec::new();
    let mut state = Scan::Code;
    let mut chars = sql.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let next = chars.peek().map(|(_, n)| *n);
        match &mut state {
            Scan::Code => match c {
                '-' if next == Some('-') => {
                    chars.next();
                    state = Scan::LineComment;
                }
                '/' if next == Some('*') => {
                    chars.next();
                    state = Scan::BlockComment(1);
                }
                '\'' => {
                    out.push(c);
                    state = Scan::SingleQuote;
                }
                '"' => {
                    out.push(c);
                    state = Scan::DoubleQuote;
                }
                '$' => {
                    // `$tag$` or `$$` opens a dollar-quoted body; `$1` does not.
                    let rest = &sql[idx + 1..];
                    match rest.find('$') {
                        Some(end)
                            if rest[..end]
                                .chars()
                                .all(|ch| ch.is_alphanumeric() || ch == '_')
                                && !rest[..end].starts_with(|ch: char| ch.is_ascii_digit()) =>
                        {
                            let tag = format!("${}$", &rest[..end]);
                            out.push_str(&tag);
                            for _ in 0..rest[..end].chars().count() + 1 {
                                chars.next();
                            }
                            state = Scan::Dollar(tag);
                        }
                        _ => out.push(c),
                    }
                }
                ';' => {
                    separators.push(out.len());
                    out.push(c);
                }
                _ => out.push(c),
            },
            Scan::SingleQuote => {
                out.push(c);
                if c == '\'' {
                    if next == Some('\'') {
                        out.push('\'');
                        chars.next();
                    } else {
                        state = Scan::Code;
                    }
                }
            }
            Scan::DoubleQuote => {
                out.push(c);
                if c == '"' {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = Scan::Code;
                }
            }
            Scan::BlockComment(depth) => {
                if c == '/' && next == Some('*') {
                    chars.next();
                    *depth += 1;
                } else if c == '*' && next == Some('/') {
                    chars.next();
                    *depth -= 1;
                    if *depth == 0 {
                        out.push(' ');
                        state = Scan::Code;
                    }
                }
            }
            Scan::Dollar(tag) => {
                if sql[idx..].starts_with(tag.as_str()) {
                    out.push_str(tag);
                    for _ in 0..tag.chars().count() - 1 {
                        chars.next();
                    }
                    state = Scan::Code;
                } else {
                    out.push(c);
                }
            }
        }
    }

    match state {
        Scan::Code | Scan::LineComment => Ok((out, separators)),
        _ => Err(SafetyViolation::Unterminated),
    }
}

/// Validate generated SQL. Returns the normalized statement to execute.
pub fn validate(sql: &str) -> Result<String, SafetyViolation> {
    let (stripped, separators) = scan(sql)?;

    // Trailing semicolons (and whitespace after them) are allowed.
    let body = stripped.trim();
    let body_start = stripped.len() - stripped.trim_start().len();
    let mut statement = body.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if statement.is_empty() {
        return Err(SafetyViolation::Empty);
    }
    let statement_end = body_start + statement.len();
    if separators.iter().any(|&pos| pos < statement_end) {
        return Err(SafetyViolation::MultipleStatements);
    }
    statement = statement.trim();

    if let Some(rule) = DENYLIST.iter().find(|r| r.re.is_match(statement)) {
        return Err(SafetyViolation::Denied(rule.name));
    }
    if !ALLOWLIST.iter().any(|r| r.re.is_match(statement)) {
        return Err(SafetyViolation::NotAllowlisted);
    }
    Ok(format!("{statement};"))
}
