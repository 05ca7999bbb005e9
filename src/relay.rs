use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::{Connection, Transport};
use crate::entities::RelayEvent;
use crate::error::Error;

/// Fan-out capacity; a subscriber that lags further than this loses events,
/// which is the relay's delivery contract anyway.
const RELAY_CAPACITY: usize = 64;

/// The pub/sub hub the clients connect to.
///
/// `driverLocation` and `stopSharing` are fanned out to every other session
/// in send order, best-effort: nothing is buffered for late subscribers and
/// lagging subscribers simply miss events. `registerDriver` marks a session
/// as the active broadcaster and is not forwarded.
#[derive(Clone)]
pub struct Relay {
    events: broadcast::Sender<(Uuid, RelayEvent)>,
}

impl Relay {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(RELAY_CAPACITY);
        Self { events }
    }

    /// Attaches one session to the hub and returns its client-side pipes.
    fn attach(&self) -> Connection {
        let session = Uuid::new_v4();

        let (outbound_tx, outbound_rx) = async_channel::unbounded::<RelayEvent>();
        let (inbound_tx, inbound_rx) = async_channel::unbounded::<RelayEvent>();

        let events = self.events.clone();

        tokio::spawn(async move {
            while let Ok(event) = outbound_rx.recv().await {
                match event {
                    RelayEvent::RegisterDriver => {
                        tracing::info!("session {} registered as driver", session);
                    }
                    event => {
                        let _ = events.send((session, event));
                    }
                }
            }
        });

        let mut fanout = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                match fanout.recv().await {
                    Ok((origin, _)) if origin == session => continue,
                    Ok((_, event)) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("session {} lagged, {} events lost", session, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }
    }

    /// In-process transport straight into this hub, for tests and for
    /// screens hosted in the same process as the relay.
    pub fn local_transport(&self) -> LocalTransport {
        LocalTransport {
            relay: self.clone(),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    relay: Relay,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> Result<Connection, Error> {
        Ok(self.relay.attach())
    }
}

/// Serves the hub over TCP, one newline-delimited JSON event per line.
#[tracing::instrument(skip(relay))]
pub async fn serve(relay: Relay, addr: SocketAddr) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("relay listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        tracing::info!("session accepted from {}", peer);

        let relay = relay.clone();
        tokio::spawn(handle_session(relay, stream));
    }
}

async fn handle_session(relay: Relay, stream: TcpStream) {
    let connection = relay.attach();
    let (reader, mut writer) = stream.into_split();

    let outbound = connection.outbound;
    let inbound = connection.inbound;

    let read_task = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(event) = serde_json::from_str::<RelayEvent>(&line) else {
                continue;
            };

            if outbound.send(event).await.is_err() {
                break;
            }
        }
    });

    let write_task = tokio::spawn(async move {
        while let Ok(event) = inbound.recv().await {
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

    let _ = read_task.await;
    write_task.abort();
}
