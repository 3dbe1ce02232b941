use serde::Serialize;

/// App-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes cleanly for HTTP responses so callers get structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable label, also used for the serialized `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Config(_) => "config",
            AppError::Auth(_) => "auth",
            AppError::Upstream(_) => "upstream",
            AppError::Timeout(_) => "timeout",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout(e.to_string())
        } else {
            AppError::Upstream(e.to_string())
        }
    }
}

/// We serialize as `{ error: "...", kind: "..." }` for API consumers.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}
