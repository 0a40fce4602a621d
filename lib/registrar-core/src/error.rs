use registrar_api::SpecError;
use registrar_store::StoreError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistrarError>;

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid registry state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Store connection error: {0}")]
    Connection(StoreError),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<StoreError> for RegistrarError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidConfig(msg) => RegistrarError::Configuration(msg),
            other => RegistrarError::Connection(other),
        }
    }
}

impl RegistrarError {
    /// Errors the heartbeat loop retries on the next pass
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout { .. } => true,
            Self::Spec(err) => err.is_serialization(),
            Self::Configuration(_) | Self::InvalidState(_) | Self::Task(_) => false,
        }
    }
}
