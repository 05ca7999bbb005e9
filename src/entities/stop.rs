use std::fmt;

use serde::{Deserialize, Serialize};

/// A postal address a driver visits, as supplied by the trip-aggregation
/// endpoint. Free text, immutable for the duration of a route build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopAddress {
    pub street: String,
    pub number: String,
    pub neighbourhood: String,
    pub city: String,
    pub state: String,
}

impl fmt::Display for StopAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {} - {}",
            self.street, self.number, self.neighbourhood, self.city, self.state
        )
    }
}

/// The JSON body returned by the trip-aggregation endpoint for a given date.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TripSheet {
    pub trip_type: String,
    pub stops: Vec<StopAddress>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TripDirection {
    Outbound,
    Return,
}

impl TripDirection {
    /// The trip sheet spells direction as `"ida"` (outbound) or `"volta"`
    /// (return); anything unrecognised is treated as a return trip.
    pub fn from_trip_type(trip_type: &str) -> Self {
        match trip_type {
            "ida" => Self::Outbound,
            _ => Self::Return,
        }
    }
}
