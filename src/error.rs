//! Unified error types for the orchestration core.
//!
//! The taxonomy matters more than the variants: validation and auth errors
//! surface to the caller, transient upstream and persistence errors are
//! absorbed and retried by the owning tick loop, permanent upstream errors
//! are reclassified before anyone acts on them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Malformed intent or request. Carries the offending fields; never retried.
    #[error("validation failed: {0}")]
    Validation(ValidationFailure),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Authenticated caller acting on another user's resources.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Network timeout, 5xx, or 429 from the aggregator. Retried by the
    /// owning component per its policy.
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    /// Aggregator-reported business failure (quote expired, bad address, ...).
    #[error("aggregator rejected request: {code}: {message}")]
    PermanentUpstream { code: String, message: String },

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Decision blocked by the price-freshness guard. Internal; the current
    /// tick is skipped with a warning.
    #[error("stale price for {asset} on {chain}: snapshot is {age_secs}s old")]
    StalePrice {
        asset: String,
        chain: String,
        age_secs: i64,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwapError>;

/// Field-level validation report, surfaced verbatim to the caller.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub fields: Vec<String>,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(message: impl Into<String>, fields: Vec<&str>) -> Self {
        Self {
            message: message.into(),
            fields: fields.into_iter().map(String::from).collect(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fields.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (fields: {})", self.message, self.fields.join(", "))
        }
    }
}

impl SwapError {
    pub fn validation(message: impl Into<String>, fields: Vec<&str>) -> Self {
        SwapError::Validation(ValidationFailure::new(message, fields))
    }

    /// Whether the owning tick loop should retry rather than surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SwapError::TransientUpstream(_) | SwapError::Persistence(_) | SwapError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failure_lists_fields() {
        let err = SwapError::validation("missing required fields", vec!["fromAsset", "amount"]);
        let text = err.to_string();
        assert!(text.contains("fromAsset"));
        assert!(text.contains("amount"));
    }

    #[test]
    fn transient_classification() {
        assert!(SwapError::TransientUpstream("503".into()).is_transient());
        assert!(!SwapError::PermanentUpstream {
            code: "INVALID_ADDRESS".into(),
            message: "bad settle address".into()
        }
        .is_transient());
        assert!(!SwapError::Unauthorized("no token".into()).is_transient());
    }
}
