use std::time::Duration;

use serde_json::json;

use crate::api::RenderSurface;
use crate::entities::{Coordinates, Route};

/// Delay before the one-time route command, tolerating the sandbox's own
/// asynchronous initialization after it signals ready. Sending earlier does
/// not corrupt anything; the sandbox may just ignore the call.
pub const ROUTE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Substring that marks a sandbox notification as an error notice.
const ERROR_MARKER: &str = "error";

/// One one-way instruction for the render surface.
///
/// Marker updates are sent as soon as the surface is ready; the route
/// command is sent once per screen lifetime after the settle window.
#[derive(Clone, Debug)]
pub enum BridgeMessage {
    UpdateDriverMarker(Coordinates),
    UpdateDriver(Coordinates),
    UpdatePassenger(Coordinates),
    CalculateRoute(Route),
}

/// Submits a command to the sandbox. Fire-and-forget: there is no return
/// value and no completion signal. Failures inside the sandbox (including a
/// missing target function) are caught there and surface only as free-form
/// notifications.
pub fn send_command(surface: &dyn RenderSurface, message: &BridgeMessage) {
    surface.eval(&render_script(message));
}

/// Whether a sandbox notification should be shown as a non-blocking error
/// notice. Everything else is plain advisory text.
pub fn is_error_notice(notice: &str) -> bool {
    notice.to_lowercase().contains(ERROR_MARKER)
}

fn render_script(message: &BridgeMessage) -> String {
    let call = match message {
        BridgeMessage::UpdateDriverMarker(coordinates) => {
            format!("updateDriverMarker({}, {});", coordinates.lat, coordinates.lng)
        }
        BridgeMessage::UpdateDriver(coordinates) => format!(
            "handleHostMessage({});",
            json!({ "type": "updateDriver", "location": coordinates })
        ),
        BridgeMessage::UpdatePassenger(coordinates) => format!(
            "handleHostMessage({});",
            json!({ "type": "updatePassenger", "location": coordinates })
        ),
        BridgeMessage::CalculateRoute(route) => {
            format!("calculateAndDisplayRoute({});", json!(route))
        }
    };

    format!(
        "try {{ {} }} catch (err) {{ notifyHost('map error: ' + err.message); }} true;",
        call
    )
}
