use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::api::{Connection, Transport};
use crate::entities::{Coordinates, RelayEvent};
use crate::error::Error;

enum ChannelState {
    Disconnected,
    Connecting,
    Connected {
        connection: Connection,
        announced: bool,
        pumps: Vec<JoinHandle<()>>,
    },
}

/// Client handle for the pub/sub relay.
///
/// One handle per screen lifetime; `connect` on mount, `disconnect` on
/// unmount. The handle does not enforce role exclusion: a caller must use it
/// as either driver or passenger within a given session, never both.
pub struct PublishChannel {
    transport: Arc<dyn Transport>,
    state: Mutex<ChannelState>,
    // bumped on every disconnect so a connect still in flight at that
    // point cannot resurrect the session when it resolves
    epoch: AtomicU64,
}

impl PublishChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(ChannelState::Disconnected),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ChannelState::Connected { .. })
    }

    /// Idempotent: connecting while connected (or while another connect is
    /// in flight) is a no-op. There is no automatic reconnection; a failed
    /// connect leaves the handle disconnected until the owner tries again.
    /// A `disconnect` issued while the transport call is pending wins: the
    /// call resolves `Ok` but the handle stays disconnected.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), Error> {
        let epoch;
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ChannelState::Disconnected => {
                    *state = ChannelState::Connecting;
                    epoch = self.epoch.load(Ordering::SeqCst);
                }
                _ => return Ok(()),
            }
        }

        match self.transport.connect().await {
            Ok(connection) => {
                let mut state = self.state.lock().unwrap();

                let cancelled = self.epoch.load(Ordering::SeqCst) != epoch
                    || !matches!(*state, ChannelState::Connecting);

                if cancelled {
                    tracing::info!("connect overtaken by disconnect, dropping session");
                    connection.outbound.close();
                    return Ok(());
                }

                tracing::info!("channel connected");
                *state = ChannelState::Connected {
                    connection,
                    announced: false,
                    pumps: Vec::new(),
                };
                Ok(())
            }
            Err(err) => {
                tracing::warn!("channel connect failed: {}", err.message);

                let mut state = self.state.lock().unwrap();
                if matches!(*state, ChannelState::Connecting) {
                    *state = ChannelState::Disconnected;
                }

                Err(err)
            }
        }
    }

    /// Registers this connection as the active driver broadcaster. Sent at
    /// most once per connected session.
    pub fn register_driver(&self) {
        let mut state = self.state.lock().unwrap();

        if let ChannelState::Connected {
            connection,
            announced,
            ..
        } = &mut *state
        {
            if *announced {
                return;
            }

            *announced = true;
            let _ = connection.outbound.try_send(RelayEvent::RegisterDriver);
        }
    }

    /// Broadcasts one driver sample. Best-effort: when the session is gone
    /// the sample is simply lost.
    pub fn publish_location(&self, coordinates: Coordinates) {
        let state = self.state.lock().unwrap();

        if let ChannelState::Connected { connection, .. } = &*state {
            let event = RelayEvent::DriverLocation(coordinates.into());

            if connection.outbound.try_send(event).is_err() {
                tracing::warn!("channel closed, dropping location sample");
            }
        }
    }

    /// Tells subscribers the feed ended, as opposed to an abrupt disconnect
    /// (which they must also tolerate).
    pub fn stop_sharing(&self) {
        let state = self.state.lock().unwrap();

        if let ChannelState::Connected { connection, .. } = &*state {
            let _ = connection.outbound.try_send(RelayEvent::StopSharing);
        }
    }

    /// Subscribes to the broadcasting driver's validated positions.
    ///
    /// Malformed `driverLocation` payloads are dropped inside the pump and
    /// never reach the receiver. Intended for a single subscriber per
    /// session; the receiver is closed when the channel disconnects. When
    /// called while disconnected the returned receiver is already closed.
    pub fn subscribe(&self) -> async_channel::Receiver<Coordinates> {
        let (tx, rx) = async_channel::unbounded();

        let mut state = self.state.lock().unwrap();

        if let ChannelState::Connected {
            connection, pumps, ..
        } = &mut *state
        {
            let inbound = connection.inbound.clone();

            pumps.push(tokio::spawn(async move {
                while let Ok(event) = inbound.recv().await {
                    let RelayEvent::DriverLocation(payload) = event else {
                        continue;
                    };

                    let Some(coordinates) = payload.validate() else {
                        continue;
                    };

                    if tx.send(coordinates).await.is_err() {
                        break;
                    }
                }
            }));
        }

        rx
    }

    /// Idempotent: disconnecting while not connected is a no-op, not an
    /// error.
    #[tracing::instrument(skip(self))]
    pub fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();

        if let ChannelState::Connected {
            connection, pumps, ..
        } = &mut *state
        {
            connection.outbound.close();

            for pump in pumps.drain(..) {
                pump.abort();
            }

            tracing::info!("channel disconnected");
        }

        *state = ChannelState::Disconnected;
    }
}

/// Newline-delimited JSON over TCP, the wire form of [`RelayEvent`].
#[derive(Clone, Debug)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    #[tracing::instrument(skip(self))]
    async fn connect(&self) -> Result<Connection, Error> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (reader, mut writer) = stream.into_split();

        let (outbound_tx, outbound_rx) = async_channel::unbounded::<RelayEvent>();
        let (inbound_tx, inbound_rx) = async_channel::unbounded::<RelayEvent>();

        tokio::spawn(async move {
            while let Ok(event) = outbound_rx.recv().await {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(_) => continue,
                };
                line.push('\n');

                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                // unparseable traffic is dropped, not an error
                let Ok(event) = serde_json::from_str::<RelayEvent>(&line) else {
                    continue;
                };

                if inbound_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
