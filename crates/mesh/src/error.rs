//! Error types for mesh operations

use shared::ErrorClass;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },

    #[error("Link error: {0}")]
    LinkError(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Origination rejected: {0}")]
    OriginationRejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MeshError::TransportUnavailable(_) => ErrorClass::TransportUnavailable,
            MeshError::NegotiationFailed { .. } | MeshError::LinkError(_) | MeshError::Other(_) => {
                ErrorClass::NegotiationFailure
            }
            MeshError::MalformedPayload(_) => ErrorClass::MalformedPayload,
            MeshError::Persistence(_) => ErrorClass::PersistenceFailure,
            MeshError::OriginationRejected(_) => ErrorClass::OriginationRejected,
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::LinkError(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::MalformedPayload(err.to_string())
    }
}

impl From<shared::Error> for MeshError {
    fn from(err: shared::Error) -> Self {
        match err {
            shared::Error::Storage(msg) => MeshError::Persistence(msg),
            shared::Error::Serialization(msg) => MeshError::MalformedPayload(msg),
            shared::Error::Validation(msg) => MeshError::OriginationRejected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_errors_keep_their_class() {
        for err in [
            shared::Error::Storage("disk".into()),
            shared::Error::Serialization("json".into()),
            shared::Error::Validation("lat".into()),
        ] {
            let class = err.class();
            assert_eq!(MeshError::from(err).class(), class);
        }
    }

    #[test]
    fn test_io_error_is_link_error() {
        let err = MeshError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(err, MeshError::LinkError(_)));
        assert_eq!(err.class(), ErrorClass::NegotiationFailure);
    }

    #[test]
    fn test_every_variant_has_a_class() {
        let cases = [
            (MeshError::TransportUnavailable("radio".into()), ErrorClass::TransportUnavailable),
            (
                MeshError::NegotiationFailed {
                    peer: "peer-b".into(),
                    reason: "answer".into(),
                },
                ErrorClass::NegotiationFailure,
            ),
            (MeshError::LinkError("reset".into()), ErrorClass::NegotiationFailure),
            (MeshError::MalformedPayload("json".into()), ErrorClass::MalformedPayload),
            (MeshError::Persistence("disk".into()), ErrorClass::PersistenceFailure),
            (MeshError::OriginationRejected("lat".into()), ErrorClass::OriginationRejected),
            (MeshError::Other(anyhow::anyhow!("boom")), ErrorClass::NegotiationFailure),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "{}", err);
        }
    }
}
