use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Coordinates;

/// A drivable route: origin, destination and the ordered waypoints between
/// them, ready to be handed to the render surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub origin: Coordinates,
    pub destination: Coordinates,
    pub waypoints: Vec<Coordinates>,
}

impl Route {
    pub fn new(origin: Coordinates, destination: Coordinates, waypoints: Vec<Coordinates>) -> Self {
        Route {
            id: Uuid::new_v4(),
            origin,
            destination,
            waypoints,
        }
    }
}
