use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::api::{RenderSurface, SurfaceEvent, TripSource};
use crate::bridge::{self, BridgeMessage, ROUTE_SETTLE_DELAY};
use crate::channel::PublishChannel;
use crate::controller::ControllerState;
use crate::entities::{Coordinates, Route, TripDirection};
use crate::routing::RouteBuilder;
use crate::sampler::LocationSampler;

/// State shared with the tasks a mounted driver screen spawns. Everything
/// here dies with the screen: the `mounted` flag is the guard every late
/// async resolution must check before acting.
struct Session {
    surface: Arc<dyn RenderSurface>,
    surface_ready: AtomicBool,
    route_requested: AtomicBool,
    mounted: AtomicBool,
    // bumped on every surface fault so a settle task from a previous ready
    // cycle cannot fire after the surface came back
    ready_epoch: AtomicU64,
    route: Mutex<Option<Route>>,
    alerts: async_channel::Sender<String>,
}

impl Session {
    /// Issues the one-time route command once both preconditions hold:
    /// the surface signalled ready and a route was built. The command is
    /// delayed by the settle window to tolerate the sandbox's own
    /// initialization.
    fn maybe_request_route(self: &Arc<Self>) {
        if !self.surface_ready.load(Ordering::SeqCst) {
            return;
        }

        if self.route.lock().unwrap().is_none() {
            return;
        }

        if self.route_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let epoch = self.ready_epoch.load(Ordering::SeqCst);
        let session = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(ROUTE_SETTLE_DELAY).await;

            if !session.mounted.load(Ordering::SeqCst)
                || !session.surface_ready.load(Ordering::SeqCst)
                || session.ready_epoch.load(Ordering::SeqCst) != epoch
            {
                return;
            }

            let route = session.route.lock().unwrap().clone();

            if let Some(route) = route {
                bridge::send_command(
                    session.surface.as_ref(),
                    &BridgeMessage::CalculateRoute(route),
                );
            }
        });
    }
}

/// Orchestrates the driver map screen: builds the route from the day's stop
/// list and pushes it to the render surface, then broadcasts every accepted
/// GPS sample over the channel while mirroring it as a marker command.
pub struct DriverController {
    channel: Arc<PublishChannel>,
    sampler: Arc<LocationSampler>,
    route_builder: RouteBuilder,
    trips: Arc<dyn TripSource>,
    home: Coordinates,
    state: Mutex<ControllerState>,
    session: Arc<Session>,
    surface_pump: Mutex<Option<JoinHandle<()>>>,
    alerts_rx: async_channel::Receiver<String>,
}

impl DriverController {
    pub fn new(
        channel: Arc<PublishChannel>,
        sampler: Arc<LocationSampler>,
        route_builder: RouteBuilder,
        trips: Arc<dyn TripSource>,
        surface: Arc<dyn RenderSurface>,
        home: Coordinates,
    ) -> Self {
        let (alerts, alerts_rx) = async_channel::unbounded();

        Self {
            channel,
            sampler,
            route_builder,
            trips,
            home,
            state: Mutex::new(ControllerState::Idle),
            session: Arc::new(Session {
                surface,
                surface_ready: AtomicBool::new(false),
                route_requested: AtomicBool::new(false),
                mounted: AtomicBool::new(false),
                ready_epoch: AtomicU64::new(0),
                route: Mutex::new(None),
                alerts,
            }),
            surface_pump: Mutex::new(None),
            alerts_rx,
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap()
    }

    /// Non-blocking notices for the user: sandbox-reported errors and the
    /// permission-denied alert.
    pub fn alerts(&self) -> async_channel::Receiver<String> {
        self.alerts_rx.clone()
    }

    #[tracing::instrument(skip(self))]
    pub async fn mount(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ControllerState::Idle {
                return;
            }
            *state = ControllerState::Connecting;
        }

        self.session.mounted.store(true, Ordering::SeqCst);
        self.spawn_surface_pump();

        match self.trips.fetch_trip_sheet(Utc::now().date_naive()).await {
            Ok(sheet) => {
                let direction = TripDirection::from_trip_type(&sheet.trip_type);

                let route = self
                    .route_builder
                    .build(&sheet.stops, direction, self.home)
                    .await;

                if let Some(route) = route {
                    if self.session.mounted.load(Ordering::SeqCst) {
                        *self.session.route.lock().unwrap() = Some(route);
                        self.session.maybe_request_route();
                    }
                }
            }
            // no sheet degrades to position sharing without a route
            Err(err) => tracing::warn!("trip sheet fetch failed: {}", err.message),
        }

        if self.channel.connect().await.is_err() {
            // non-functional until the screen remounts
            return;
        }

        if !self.session.mounted.load(Ordering::SeqCst) {
            self.channel.disconnect();
            return;
        }

        self.channel.register_driver();

        *self.state.lock().unwrap() = ControllerState::Active;

        let channel = self.channel.clone();
        let session = self.session.clone();

        self.sampler
            .start(move |position| {
                if !session.mounted.load(Ordering::SeqCst) {
                    return;
                }

                // marker first, then the channel emission
                if session.surface_ready.load(Ordering::SeqCst) {
                    bridge::send_command(
                        session.surface.as_ref(),
                        &BridgeMessage::UpdateDriverMarker(position),
                    );
                }

                channel.publish_location(position);
            })
            .await;

        if let Some(message) = self.sampler.last_error() {
            // permission denial is the one blocking, user-facing failure
            let _ = self.session.alerts.try_send(message);
        }
    }

    /// Explicit end of trip: tells subscribers the feed ended, then tears
    /// down exactly like an unmount.
    #[tracing::instrument(skip(self))]
    pub fn finish_trip(&self) {
        self.channel.stop_sharing();
        self.teardown();
    }

    /// Back-navigation teardown. Always safe, even when `finish_trip` was
    /// never pressed or was already handled.
    #[tracing::instrument(skip(self))]
    pub fn unmount(&self) {
        self.teardown();
    }

    fn teardown(&self) {
        *self.state.lock().unwrap() = ControllerState::Finishing;

        self.session.mounted.store(false, Ordering::SeqCst);

        if let Some(pump) = self.surface_pump.lock().unwrap().take() {
            pump.abort();
        }

        self.sampler.stop();
        self.channel.disconnect();

        *self.state.lock().unwrap() = ControllerState::Idle;
    }

    fn spawn_surface_pump(&self) {
        let session = self.session.clone();
        let events = self.session.surface.events();

        let pump = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if !session.mounted.load(Ordering::SeqCst) {
                    break;
                }

                match event {
                    SurfaceEvent::Ready => {
                        session.surface_ready.store(true, Ordering::SeqCst);
                        session.maybe_request_route();
                    }
                    SurfaceEvent::Terminated => {
                        tracing::warn!("render surface terminated, reloading");
                        session.ready_epoch.fetch_add(1, Ordering::SeqCst);
                        session.surface_ready.store(false, Ordering::SeqCst);
                        session.route_requested.store(false, Ordering::SeqCst);
                        session.surface.reload();
                    }
                    SurfaceEvent::Notification(text) => {
                        if bridge::is_error_notice(&text) {
                            let _ = session.alerts.try_send(text);
                        } else {
                            tracing::info!("surface notice: {}", text);
                        }
                    }
                }
            }
        });

        *self.surface_pump.lock().unwrap() = Some(pump);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::api::{Connection, Transport};
    use crate::controller::fakes::{
        ipatinga_stop, FakeGeocoder, FakePositions, FakeSurface, FakeTrips,
    };
    use crate::entities::{RelayEvent, TripSheet};
    use crate::error::{channel_closed_error, Error};
    use crate::relay::Relay;

    const HOME: Coordinates = Coordinates { lat: -19.47, lng: -42.55 };

    struct Fixture {
        controller: DriverController,
        surface: Arc<FakeSurface>,
        positions_tx: async_channel::Sender<Coordinates>,
        relay: Relay,
    }

    fn fixture(geocoder: FakeGeocoder, sheet: TripSheet) -> Fixture {
        let relay = Relay::new();
        let surface = FakeSurface::new();

        // one-shot fix is the zero sentinel so tests only see watch samples
        let (positions, positions_tx) = FakePositions::new(Coordinates::new(0.0, 0.0));

        let controller = DriverController::new(
            Arc::new(PublishChannel::new(Arc::new(relay.local_transport()))),
            Arc::new(LocationSampler::new(positions)),
            RouteBuilder::new(Arc::new(geocoder)),
            Arc::new(FakeTrips { sheet }),
            surface.clone(),
            HOME,
        );

        Fixture {
            controller,
            surface,
            positions_tx,
            relay,
        }
    }

    fn three_stop_sheet() -> (FakeGeocoder, TripSheet) {
        let stops = vec![
            ipatinga_stop("Rua A"),
            ipatinga_stop("Rua B"),
            ipatinga_stop("Rua C"),
        ];

        let table: HashMap<String, Coordinates> = vec![
            (stops[0].to_string(), Coordinates::new(-19.50, -42.60)),
            (stops[1].to_string(), Coordinates::new(-19.51, -42.61)),
            (stops[2].to_string(), Coordinates::new(-19.52, -42.62)),
        ]
        .into_iter()
        .collect();

        (
            FakeGeocoder { table },
            TripSheet {
                trip_type: "ida".into(),
                stops,
            },
        )
    }

    fn route_from_script(script: &str) -> Route {
        let start = script.find("calculateAndDisplayRoute(").unwrap()
            + "calculateAndDisplayRoute(".len();
        // the route JSON contains no parentheses, so the first ");" ends the call
        let end = script.find(");").unwrap();
        serde_json::from_str(&script[start..end]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_outbound_trip() {
        let (geocoder, sheet) = three_stop_sheet();
        let fx = fixture(geocoder, sheet);

        // a passenger-side listener on the same relay
        let listener = PublishChannel::new(Arc::new(fx.relay.local_transport()));
        listener.connect().await.unwrap();
        let listener_rx = listener.subscribe();

        fx.controller.mount().await;
        assert_eq!(fx.controller.state(), ControllerState::Active);

        fx.surface.emit(SurfaceEvent::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the route command waits for the settle window
        assert!(fx.surface.evals_containing("calculateAndDisplayRoute").is_empty());

        tokio::time::sleep(ROUTE_SETTLE_DELAY).await;

        let route_evals = fx.surface.evals_containing("calculateAndDisplayRoute");
        assert_eq!(route_evals.len(), 1);

        let route = route_from_script(&route_evals[0]);
        assert_eq!(route.origin, Coordinates::new(-19.50, -42.60));
        assert_eq!(route.destination, HOME);
        assert_eq!(route.waypoints.len(), 2);

        // each GPS sample: one marker command, one channel emission
        let sample = Coordinates::new(-19.505, -42.605);
        fx.positions_tx.send(sample).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.surface.evals_containing("updateDriverMarker").len(), 1);
        assert_eq!(listener_rx.recv().await.unwrap(), sample);

        // no second route command ever
        tokio::time::sleep(ROUTE_SETTLE_DELAY).await;
        assert_eq!(fx.surface.evals_containing("calculateAndDisplayRoute").len(), 1);

        fx.controller.unmount();
        listener.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn no_route_command_when_nothing_geocodes() {
        let (_, sheet) = three_stop_sheet();
        // empty table: every stop fails to resolve
        let fx = fixture(
            FakeGeocoder {
                table: HashMap::new(),
            },
            sheet,
        );

        fx.controller.mount().await;
        fx.surface.emit(SurfaceEvent::Ready);

        tokio::time::sleep(ROUTE_SETTLE_DELAY * 2).await;
        assert!(fx.surface.evals_containing("calculateAndDisplayRoute").is_empty());

        fx.controller.unmount();
    }

    #[tokio::test(start_paused = true)]
    async fn surface_fault_reloads_and_reissues_the_route() {
        let (geocoder, sheet) = three_stop_sheet();
        let fx = fixture(geocoder, sheet);

        fx.controller.mount().await;
        fx.surface.emit(SurfaceEvent::Ready);
        tokio::time::sleep(ROUTE_SETTLE_DELAY + Duration::from_millis(50)).await;
        assert_eq!(fx.surface.evals_containing("calculateAndDisplayRoute").len(), 1);

        fx.surface.emit(SurfaceEvent::Terminated);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.surface.reloads.load(Ordering::SeqCst), 1);

        // markers are gated off until the reloaded surface is ready
        fx.positions_tx
            .send(Coordinates::new(-19.505, -42.605))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.surface.evals_containing("updateDriverMarker").is_empty());

        fx.surface.emit(SurfaceEvent::Ready);
        tokio::time::sleep(ROUTE_SETTLE_DELAY + Duration::from_millis(50)).await;
        assert_eq!(fx.surface.evals_containing("calculateAndDisplayRoute").len(), 2);

        fx.controller.unmount();
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_tears_down_even_without_finish_trip() {
        let (geocoder, sheet) = three_stop_sheet();
        let fx = fixture(geocoder, sheet);

        let listener = PublishChannel::new(Arc::new(fx.relay.local_transport()));
        listener.connect().await.unwrap();
        let listener_rx = listener.subscribe();

        fx.controller.mount().await;
        fx.surface.emit(SurfaceEvent::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.controller.unmount();
        fx.controller.unmount(); // idempotent
        assert_eq!(fx.controller.state(), ControllerState::Idle);

        let eval_count = fx.surface.evals.lock().unwrap().len();

        fx.positions_tx
            .send(Coordinates::new(-19.505, -42.605))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.surface.evals.lock().unwrap().len(), eval_count);
        assert!(listener_rx.try_recv().is_err());

        listener.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_error_notifications_become_alerts() {
        let (geocoder, sheet) = three_stop_sheet();
        let fx = fixture(geocoder, sheet);

        fx.controller.mount().await;
        let alerts = fx.controller.alerts();

        fx.surface
            .emit(SurfaceEvent::Notification("map error: no tiles".into()));
        fx.surface
            .emit(SurfaceEvent::Notification("route rendered".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(alerts.try_recv().unwrap(), "map error: no tiles");
        assert!(alerts.try_recv().is_err());

        fx.controller.unmount();
    }

    #[tokio::test(start_paused = true)]
    async fn fault_and_recovery_inside_the_settle_window_issues_one_route() {
        let (geocoder, sheet) = three_stop_sheet();
        let fx = fixture(geocoder, sheet);

        fx.controller.mount().await;
        fx.surface.emit(SurfaceEvent::Ready);
        tokio::time::sleep(Duration::from_millis(500)).await;

        // fault and recover before the first settle deadline
        fx.surface.emit(SurfaceEvent::Terminated);
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.surface.emit(SurfaceEvent::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the first ready cycle's deadline passes without a command
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(fx.surface.evals_containing("calculateAndDisplayRoute").is_empty());

        // the second cycle's deadline issues exactly one
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.surface.evals_containing("calculateAndDisplayRoute").len(), 1);

        fx.controller.unmount();
    }

    struct HeldTransport {
        connection: Mutex<Option<Connection>>,
    }

    #[async_trait]
    impl Transport for HeldTransport {
        async fn connect(&self) -> Result<Connection, Error> {
            self.connection
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| channel_closed_error())
        }
    }

    /// Records marker evals together with whether the channel emission for
    /// the same sample had already been enqueued at that point.
    struct MarkerOrderSurface {
        markers: Mutex<Vec<bool>>,
        outbound: async_channel::Receiver<RelayEvent>,
        events_tx: async_channel::Sender<SurfaceEvent>,
        events_rx: async_channel::Receiver<SurfaceEvent>,
    }

    impl RenderSurface for MarkerOrderSurface {
        fn eval(&self, script: &str) {
            if script.contains("updateDriverMarker") {
                self.markers.lock().unwrap().push(self.outbound.is_empty());
            }
        }

        fn reload(&self) {}

        fn events(&self) -> async_channel::Receiver<SurfaceEvent> {
            self.events_rx.clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn marker_command_precedes_channel_emission_per_sample() {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (_inbound_tx, inbound_rx) = async_channel::unbounded::<RelayEvent>();

        let transport = HeldTransport {
            connection: Mutex::new(Some(Connection {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })),
        };

        let (events_tx, events_rx) = async_channel::unbounded();
        let surface = Arc::new(MarkerOrderSurface {
            markers: Mutex::new(Vec::new()),
            outbound: outbound_rx.clone(),
            events_tx,
            events_rx,
        });

        let (geocoder, sheet) = three_stop_sheet();
        let (positions, positions_tx) = FakePositions::new(Coordinates::new(0.0, 0.0));

        let controller = DriverController::new(
            Arc::new(PublishChannel::new(Arc::new(transport))),
            Arc::new(LocationSampler::new(positions)),
            RouteBuilder::new(Arc::new(geocoder)),
            Arc::new(FakeTrips { sheet }),
            surface.clone(),
            HOME,
        );

        controller.mount().await;
        let _ = surface.events_tx.try_send(SurfaceEvent::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // drain the announcement so only the sample's emission remains
        assert!(matches!(
            outbound_rx.try_recv(),
            Ok(RelayEvent::RegisterDriver)
        ));

        let sample = Coordinates::new(-19.505, -42.605);
        positions_tx.send(sample).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // exactly one marker, recorded before the emission was enqueued
        assert_eq!(surface.markers.lock().unwrap().as_slice(), &[true]);

        match outbound_rx.try_recv() {
            Ok(RelayEvent::DriverLocation(payload)) => {
                assert_eq!(payload.validate(), Some(sample));
            }
            other => panic!("expected a driverLocation emission, got {:?}", other),
        }

        controller.unmount();
    }
}
