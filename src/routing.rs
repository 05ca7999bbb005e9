use std::sync::Arc;

use futures::StreamExt;

use crate::api::Geocoder;
use crate::entities::{Coordinates, Route, StopAddress, TripDirection};

/// How many geocoding requests may be in flight at once. `buffered` keeps
/// the results in input order regardless of completion order.
pub const GEOCODE_CONCURRENCY: usize = 4;

/// Turns an ordered stop list into a drivable route by resolving each
/// address through the injected [`Geocoder`].
pub struct RouteBuilder {
    geocoder: Arc<dyn Geocoder>,
}

impl RouteBuilder {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { geocoder }
    }

    /// Resolves every stop and assembles the route for the given direction.
    ///
    /// A stop that fails to resolve is logged and dropped; the rest of the
    /// route survives. `None` when nothing resolved.
    #[tracing::instrument(skip(self, stops), fields(stops = stops.len()))]
    pub async fn build(
        &self,
        stops: &[StopAddress],
        direction: TripDirection,
        home: Coordinates,
    ) -> Option<Route> {
        let resolved: Vec<Option<Coordinates>> = futures::stream::iter(stops)
            .map(|stop| {
                let geocoder = self.geocoder.clone();
                let address = stop.to_string();

                async move {
                    match geocoder.geocode(&address).await {
                        Ok(coordinates) => Some(coordinates),
                        Err(err) => {
                            tracing::warn!("failed to geocode \"{}\": {}", address, err.message);
                            None
                        }
                    }
                }
            })
            .buffered(GEOCODE_CONCURRENCY)
            .collect()
            .await;

        assemble(resolved.into_iter().flatten().collect(), direction, home)
    }
}

/// Direction-dependent route assembly.
///
/// A return trip retraces the outbound stops backwards, so the resolved
/// list is reversed as a whole before the same origin/destination split is
/// applied: the first (possibly reversed) stop becomes the origin, home is
/// always the destination, everything else becomes the waypoints.
pub fn assemble(
    mut resolved: Vec<Coordinates>,
    direction: TripDirection,
    home: Coordinates,
) -> Option<Route> {
    if resolved.is_empty() {
        return None;
    }

    if direction == TripDirection::Return {
        resolved.reverse();
    }

    let origin = resolved.remove(0);

    Some(Route::new(origin, home, resolved))
}
