use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaperError {
    /// A trigger or untrigger expression failed to compile: syntax error,
    /// unknown identifier, or a form that cannot evaluate over numeric
    /// variables. Fatal to the (re)configuration that supplied it.
    #[error("expression `{expression}` failed to compile: {reason}")]
    Expression { expression: String, reason: String },

    /// The configuration blob was structurally malformed.
    #[error("malformed configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for filter operations.
pub type Result<T> = std::result::Result<T, TaperError>;
