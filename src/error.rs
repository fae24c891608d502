// Error taxonomy for the resource core
//
// Configuration and exhaustion errors fail creation calls. Protocol
// violations are logged and leave all state untouched.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed descriptor or configuration, detected at creation time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Illegal map/unmap sequence, stale dynamic allocation, conflicting map
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Native allocation or backing-memory failure
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The backend lacks the capability for the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, EngineError::ProtocolViolation(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

/// Log an error at the component boundary. Protocol violations panic when
/// strict validation is enabled.
pub(crate) fn report(err: EngineError, strict: bool) -> EngineError {
    match &err {
        EngineError::ProtocolViolation(message) => {
            log::error!("{}", message);
            if strict {
                panic!("{}", message);
            }
        }
        EngineError::Unsupported(message) => log::warn!("{}", message),
        EngineError::Configuration(message) | EngineError::ResourceExhaustion(message) => {
            log::error!("{}", message)
        }
        EngineError::Backend(source) => log::error!("Backend error: {:#}", source),
    }
    err
}
