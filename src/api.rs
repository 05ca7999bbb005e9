use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;

use crate::entities::{Coordinates, RelayEvent, TripSheet};
use crate::error::Error;

/// The device positioning API. Implementations are platform glue; everything
/// above this seam is testable with a scripted source.
#[async_trait]
pub trait PositionSource: Send + Sync + 'static {
    /// Prompts for foreground positioning permission. `Err` means denied.
    async fn request_permission(&self) -> Result<(), Error>;

    /// A single high-accuracy fix.
    async fn current_position(&self) -> Result<Coordinates, Error>;

    /// An infinite stream of raw position fixes. Throttling is the
    /// sampler's job, not the source's.
    fn watch(&self) -> BoxStream<'static, Result<Coordinates, Error>>;
}

/// Forward geocoding: free-text postal address to coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync + 'static {
    async fn geocode(&self, address: &str) -> Result<Coordinates, Error>;
}

/// The trip-aggregation endpoint, consumed only as a JSON source for the
/// day's ordered stop list.
#[async_trait]
pub trait TripSource: Send + Sync + 'static {
    async fn fetch_trip_sheet(&self, date: NaiveDate) -> Result<TripSheet, Error>;
}

/// Lifecycle and advisory signals emitted by a render surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Initial load (or reload) finished; commands may now be sent.
    Ready,
    /// The sandbox process died; the owner must reload and re-issue state.
    Terminated,
    /// Free-form text the sandbox sent back. Advisory only, never structured.
    Notification(String),
}

/// The embedded, sandboxed map-rendering surface. Its only input primitive
/// is fire-and-forget script execution; it shares no memory with the host
/// and returns no values.
pub trait RenderSurface: Send + Sync + 'static {
    fn eval(&self, script: &str);

    fn reload(&self);

    fn events(&self) -> async_channel::Receiver<SurfaceEvent>;
}

/// A live connection to the relay: an outbound event pipe and an inbound
/// event pipe. Both ends are best-effort; closing either side ends the
/// session.
pub struct Connection {
    pub outbound: async_channel::Sender<RelayEvent>,
    pub inbound: async_channel::Receiver<RelayEvent>,
}

/// Transport used by [`crate::channel::PublishChannel`] to reach the relay.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, Error>;
}
