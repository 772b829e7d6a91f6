//! Error types for the passport service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PassportError {
    #[error("Insufficient funds: account {account} has {balance}, needs {required}")]
    InsufficientFunds {
        account: String,
        balance: String,
        required: String,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Storage fault: {0}")]
    StorageFault(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PassportError {
    /// Permanent errors must not be retried with the same parameters.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PassportError::InsufficientFunds { .. }
                | PassportError::InvalidAmount(_)
                | PassportError::Forbidden(_)
                | PassportError::NotFound(_)
                | PassportError::InvalidInput(_)
        )
    }

    /// Message safe to hand back to a caller. Internal causes stay in the logs.
    pub fn safe_message(&self) -> String {
        match self {
            PassportError::InsufficientFunds { .. } => "Insufficient funds.".to_string(),
            PassportError::InvalidAmount(msg) => format!("Invalid amount: {}", msg),
            PassportError::Forbidden(msg) => msg.clone(),
            PassportError::NotFound(msg) => format!("Not found: {}", msg),
            PassportError::Conflict(msg) => msg.clone(),
            PassportError::InvalidInput(msg) => format!("Invalid input: {}", msg),
            PassportError::UpstreamUnavailable(_) => {
                "Upstream service unavailable, please try again later.".to_string()
            }
            PassportError::StorageFault(_)
            | PassportError::Serialization(_)
            | PassportError::Config(_)
            | PassportError::Io(_) => "Internal error, please try again or contact support.".to_string(),
        }
    }

    /// HTTP status code used by the API and RPC surfaces
    pub fn status_code(&self) -> u16 {
        match self {
            PassportError::InsufficientFunds { .. }
            | PassportError::InvalidAmount(_)
            | PassportError::InvalidInput(_) => 400,
            PassportError::Forbidden(_) => 403,
            PassportError::NotFound(_) => 404,
            PassportError::Conflict(_) => 409,
            PassportError::UpstreamUnavailable(_) => 503,
            _ => 500,
        }
    }
}

impl From<sled::Error> for PassportError {
    fn from(e: sled::Error) -> Self {
        PassportError::StorageFault(e.to_string())
    }
}

impl From<serde_json::Error> for PassportError {
    fn from(e: serde_json::Error) -> Self {
        PassportError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for PassportError {
    fn from(e: reqwest::Error) -> Self {
        PassportError::UpstreamUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PassportError>;
