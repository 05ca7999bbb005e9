mod driver;
mod passenger;

pub use driver::DriverController;
pub use passenger::PassengerController;

/// Shared controller lifecycle. `Finishing` is entered by explicit user
/// action or by screen unmount and always performs disconnect plus
/// sampler-stop before returning to `Idle`. There is no retry state: a
/// failed connect leaves the controller non-functional until remount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Connecting,
    Active,
    Finishing,
}
