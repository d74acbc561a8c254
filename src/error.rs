//! Error types for the onboarding sync core.

use crate::run::model::StepStatus;

/// Top-level error type for the sync core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Session Registry errors.
///
/// Both variants are recoverable: `NotFound` means the caller should
/// re-initiate or surface a message, `DuplicateRun` means the caller decides
/// reset-or-reject. Neither is ever resolved implicitly by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No run exists for participant {key}")]
    NotFound { key: String },

    #[error("An active run already exists for participant {key}")]
    DuplicateRun { key: String },
}

/// Step Ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// An illegal step-status change was attempted. Indicates a logic error
    /// upstream; the ledger rejects it rather than coercing the status.
    #[error("Step {step_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        step_id: u32,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Step {step_id} not found in run")]
    UnknownStep { step_id: u32 },
}

/// Event Ingestion Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Rejected at the boundary: the event is missing required fields.
    /// Logged, not retried by the gateway itself.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// External provisioning errors (issue tracker, notification dispatch).
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Provisioning stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for the sync core.
pub type Result<T> = std::result::Result<T, Error>;
