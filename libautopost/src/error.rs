//! Error types for Autopost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutopostError>;

#[derive(Error, Debug)]
pub enum AutopostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition for queue entry {entry_id}: already {status}")]
    InvalidTransition { entry_id: i64, status: String },

    #[error("Collection failed: {0}")]
    Collect(String),

    #[error("Alert delivery failed: {0}")]
    Alert(String),
}

impl AutopostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AutopostError::InvalidInput(_) => 3,
            AutopostError::Config(_) => 2,
            AutopostError::Database(_) => 1,
            AutopostError::Publish(_) => 1,
            AutopostError::InvalidTransition { .. } => 1,
            AutopostError::Collect(_) => 1,
            AutopostError::Alert(_) => 1,
        }
    }

    /// Whether this error means the durable store can no longer be trusted.
    ///
    /// Scheduling must halt on a fatal error instead of continuing with
    /// state it cannot read or write.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AutopostError::Database(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Decode { table: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Post rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),
}
