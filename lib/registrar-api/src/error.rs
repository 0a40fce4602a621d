use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpecError>;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to resolve hostname: {0}")]
    Hostname(#[source] std::io::Error),

    #[error("Failed to list network interfaces: {0}")]
    Interfaces(#[source] std::io::Error),

    #[error("No private IPv4 address found on host")]
    NoPrivateAddress,

    #[error("Invalid payload for middleware {id}: {source}")]
    InvalidMiddleware {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpecError {
    /// True for errors raised while rendering records, as opposed to
    /// resolving the host identity.
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::InvalidMiddleware { .. } | Self::Serialization(_))
    }
}
