mod coordinates;
mod route;
mod stop;
mod wire;

pub use coordinates::Coordinates;
pub use route::Route;
pub use stop::{StopAddress, TripDirection, TripSheet};
pub use wire::{LocationPayload, RelayEvent};
