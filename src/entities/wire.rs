use serde::{Deserialize, Serialize};

use crate::entities::Coordinates;

/// Raw inbound shape of a `driverLocation` event. Either field may be
/// missing or null; validation happens at the subscriber, not on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocationPayload {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl LocationPayload {
    /// Applies the truthiness filter: both fields present, finite and
    /// non-zero. Anything else is malformed-but-expected traffic and yields
    /// `None` so the caller can drop it silently.
    pub fn validate(&self) -> Option<Coordinates> {
        let (Some(lat), Some(lng)) = (self.lat, self.lng) else {
            return None;
        };

        let coordinates = Coordinates::new(lat, lng);
        coordinates.is_valid().then_some(coordinates)
    }
}

impl From<Coordinates> for LocationPayload {
    fn from(coordinates: Coordinates) -> Self {
        Self {
            lat: Some(coordinates.lat),
            lng: Some(coordinates.lng),
        }
    }
}

/// Events exchanged with the pub/sub relay, one JSON object per line on the
/// TCP transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RelayEvent {
    RegisterDriver,
    DriverLocation(LocationPayload),
    StopSharing,
}
