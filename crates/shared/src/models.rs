use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Category of an emergency broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
    Emergency,
    DangerZone,
    Alert,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastKind::Emergency => "emergency",
            BroadcastKind::DangerZone => "danger_zone",
            BroadcastKind::Alert => "alert",
        }
    }
}

impl std::fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic position attached to a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// The unit of propagation in the emergency mesh.
///
/// Serialized with the field names used by the mobile clients (`userId`,
/// `type`, `timestamp`, `batteryLevel`) so payloads read from storage, data
/// channels and the proximity characteristic are interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyBroadcast {
    /// Deduplication key
    pub id: String,
    #[serde(rename = "userId")]
    pub originator_id: String,
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub location: GeoLocation,
    /// Epoch milliseconds, used for ordering only
    #[serde(rename = "timestamp")]
    pub created_at: i64,
    pub message: String,
    #[serde(
        rename = "batteryLevel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub battery_level: Option<u8>,
}

impl EmergencyBroadcast {
    /// Create a broadcast stamped with the current time and a `<kind>-<millis>` id
    pub fn new(
        kind: BroadcastKind,
        originator_id: impl Into<String>,
        location: GeoLocation,
        message: impl Into<String>,
    ) -> Self {
        let created_at = now_millis();
        Self {
            id: format!("{}-{}", kind, created_at),
            originator_id: originator_id.into(),
            kind,
            location,
            created_at,
            message: message.into(),
            battery_level: None,
        }
    }

    pub fn with_battery_level(mut self, level: u8) -> Self {
        self.battery_level = Some(level);
        self
    }

    /// Check the minimal admission rules for locally originated broadcasts
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("broadcast id is empty".to_string()));
        }
        if self.originator_id.trim().is_empty() {
            return Err(Error::Validation("originator id is empty".to_string()));
        }
        if !self.location.is_valid() {
            return Err(Error::Validation(format!(
                "location out of range: {}, {}",
                self.location.latitude, self.location.longitude
            )));
        }
        if let Some(level) = self.battery_level {
            if level > 100 {
                return Err(Error::Validation(format!("battery level {} exceeds 100", level)));
            }
        }
        Ok(())
    }

    /// Encode as the JSON wire payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON wire payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
