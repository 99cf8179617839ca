//! Error handling for the portsnap engine
//!
//! Per-target failures ([`ProbeError`], [`PersistenceError`]) are values that
//! end up inside a [`crate::model::ScanOutcome`]. Only [`EngineError`] is
//! allowed to reach the process boundary.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single probing tier (primary or fallback)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("failed to launch probe: {0}")]
    Spawn(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("malformed probe report: {0}")]
    Parse(String),

    #[error("no data returned for {0}")]
    NoData(String),

    #[error("probe error: {0}")]
    Other(String),
}

/// Both probing tiers failed for one host
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("error scanning {address}: primary failed ({primary_cause}), fallback failed ({fallback_cause})")]
pub struct ProbeError {
    pub address: String,
    pub primary_cause: ProbeFailure,
    pub fallback_cause: ProbeFailure,
}

/// A host's snapshot could not be written; the transaction was rolled back
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to start transaction: {0}")]
    Begin(String),

    #[error("failed to delete same-day rows for {address}: {cause}")]
    Delete { address: String, cause: String },

    #[error("failed to insert snapshot for {address}: {cause}")]
    Insert { address: String, cause: String },

    #[error("failed to commit snapshot for {address}: {cause}")]
    Commit { address: String, cause: String },

    #[error("snapshot query failed: {0}")]
    Query(String),
}

/// Schema provisioning problem. Never aborts a write.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("provisioning step '{step}' failed: {cause}")]
    Step { step: &'static str, cause: String },
}

impl SetupError {
    /// True for conditions a concurrent or earlier provisioner already satisfied
    pub fn is_already_exists(&self) -> bool {
        match self {
            SetupError::AlreadyExists(_) => true,
            SetupError::Step { cause, .. } => cause.contains("already exists"),
        }
    }
}

/// The scan list could not be obtained at all
#[derive(Debug, Error)]
pub enum TargetRetrievalError {
    #[error("database error while fetching targets: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid target row: {0}")]
    InvalidRow(String),
}

/// Configuration could not be loaded or is invalid
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whole-run errors; these produce a non-zero exit
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot obtain scan targets: {0}")]
    TargetRetrieval(#[from] TargetRetrievalError),

    #[error("cannot reach snapshot store: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for engine-level operations
pub type EngineResult<T> = Result<T, EngineError>;
