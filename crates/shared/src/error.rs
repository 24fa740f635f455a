use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Recovery classes shared by every mesh component.
///
/// Only `OriginationRejected` is ever surfaced to a caller; the other classes
/// are recovered locally and reported through logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransportUnavailable,
    NegotiationFailure,
    MalformedPayload,
    PersistenceFailure,
    OriginationRejected,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::TransportUnavailable => write!(f, "transport_unavailable"),
            ErrorClass::NegotiationFailure => write!(f, "negotiation_failure"),
            ErrorClass::MalformedPayload => write!(f, "malformed_payload"),
            ErrorClass::PersistenceFailure => write!(f, "persistence_failure"),
            ErrorClass::OriginationRejected => write!(f, "origination_rejected"),
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Storage(_) => ErrorClass::PersistenceFailure,
            Error::Serialization(_) => ErrorClass::MalformedPayload,
            Error::Validation(_) => ErrorClass::OriginationRejected,
        }
    }
}
