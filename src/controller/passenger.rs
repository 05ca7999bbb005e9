use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::api::{RenderSurface, SurfaceEvent};
use crate::bridge::{self, BridgeMessage};
use crate::channel::PublishChannel;
use crate::controller::ControllerState;
use crate::entities::Coordinates;

struct Session {
    surface: Arc<dyn RenderSurface>,
    surface_ready: AtomicBool,
    mounted: AtomicBool,
    own_position: Mutex<Option<Coordinates>>,
    alerts: async_channel::Sender<String>,
}

impl Session {
    /// Re-issues the passenger's own marker. Called on every position
    /// change and on every surface (re)load, so a reload never loses it.
    fn send_own_marker(&self) {
        if !self.mounted.load(Ordering::SeqCst) || !self.surface_ready.load(Ordering::SeqCst) {
            return;
        }

        let own = *self.own_position.lock().unwrap();

        if let Some(position) = own {
            if position.is_valid() {
                bridge::send_command(
                    self.surface.as_ref(),
                    &BridgeMessage::UpdatePassenger(position),
                );
            }
        }
    }
}

/// Orchestrates the passenger map screen: subscribes to the broadcasting
/// driver and mirrors validated positions onto the render surface.
pub struct PassengerController {
    channel: Arc<PublishChannel>,
    state: Mutex<ControllerState>,
    session: Arc<Session>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    alerts_rx: async_channel::Receiver<String>,
}

impl PassengerController {
    pub fn new(channel: Arc<PublishChannel>, surface: Arc<dyn RenderSurface>) -> Self {
        let (alerts, alerts_rx) = async_channel::unbounded();

        Self {
            channel,
            state: Mutex::new(ControllerState::Idle),
            session: Arc::new(Session {
                surface,
                surface_ready: AtomicBool::new(false),
                mounted: AtomicBool::new(false),
                own_position: Mutex::new(None),
                alerts,
            }),
            tasks: Mutex::new(Vec::new()),
            alerts_rx,
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap()
    }

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

        if self.channel.connect().await.is_err() {
            // non-functional until the screen remounts
            return;
        }

        if !self.session.mounted.load(Ordering::SeqCst) {
            self.channel.disconnect();
            return;
        }

        *self.state.lock().unwrap() = ControllerState::Active;

        let subscription = self.channel.subscribe();
        let session = self.session.clone();

        let forward = tokio::spawn(async move {
            while let Ok(position) = subscription.recv().await {
                if !session.mounted.load(Ordering::SeqCst) {
                    break;
                }

                // a not-yet-ready surface drops the update; the next one wins
                if session.surface_ready.load(Ordering::SeqCst) {
                    bridge::send_command(
                        session.surface.as_ref(),
                        &BridgeMessage::UpdateDriver(position),
                    );
                }
            }
        });

        self.tasks.lock().unwrap().push(forward);
    }

    /// The passenger's own device-provided coordinate, supplied by the
    /// parent screen whenever it changes.
    pub fn set_own_position(&self, position: Option<Coordinates>) {
        *self.session.own_position.lock().unwrap() = position;
        self.session.send_own_marker();
    }

    #[tracing::instrument(skip(self))]
    pub fn unmount(&self) {
        *self.state.lock().unwrap() = ControllerState::Finishing;

        self.session.mounted.store(false, Ordering::SeqCst);

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

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
                        session.send_own_marker();
                    }
                    SurfaceEvent::Terminated => {
                        tracing::warn!("render surface terminated, reloading");
                        session.surface_ready.store(false, Ordering::SeqCst);
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

        self.tasks.lock().unwrap().push(pump);
    }
}
