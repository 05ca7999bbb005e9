pub mod api;
pub mod bridge;
pub mod channel;
pub mod controller;
pub mod entities;
pub mod error;
pub mod external;
pub mod relay;
pub mod routing;
pub mod sampler;
