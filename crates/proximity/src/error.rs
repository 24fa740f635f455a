use shared::ErrorClass;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProximityError {
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("BLE error: {0}")]
    BleError(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic {characteristic} not found on service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Advertising not supported: {0}")]
    AdvertisingUnsupported(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] shared::Error),
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::SerializationError(err.to_string())
    }
}

impl From<btleplug::Error> for ProximityError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                ProximityError::PermissionDenied("bluetooth access refused".to_string())
            }
            btleplug::Error::DeviceNotFound => {
                ProximityError::DeviceNotFound("peripheral vanished".to_string())
            }
            other => ProximityError::BleError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProximityError>;

impl ProximityError {
    /// Map onto the shared recovery classes
    pub fn class(&self) -> ErrorClass {
        match self {
            ProximityError::Unavailable(_)
            | ProximityError::PermissionDenied(_)
            | ProximityError::AdvertisingUnsupported(_) => ErrorClass::TransportUnavailable,
            ProximityError::BleError(_)
            | ProximityError::DeviceNotFound(_)
            | ProximityError::CharacteristicNotFound { .. } => ErrorClass::NegotiationFailure,
            ProximityError::SerializationError(_) => ErrorClass::MalformedPayload,
            ProximityError::Storage(err) => err.class(),
        }
    }

    /// Log a recovered error with the device it concerns
    pub fn log_recovered(&self, device_id: &str, operation: &str) {
        warn!(
            error = %self,
            class = %self.class(),
            device_id = %device_id,
            operation = %operation,
            "Proximity operation failed, continuing"
        );
    }
}
