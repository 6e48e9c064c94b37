// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! TCP transport: a listener adapter for accepting peers and a client
//! adapter that dials out and reconnects with backoff.
//!
//! Each stream is segmented with a length-delimited codec; every segment is
//! one frame of the shared wire format.

use crate::adapter::{Adapter, AdapterContext, Backoff, ChannelHandle, ConnectionState};
use crate::config::BackoffConfig;
use crate::types::{AdapterId, ChannelKind};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Shovels frames between the runtime and one framed TCP stream until
/// either side gives up. Returns on disconnect.
async fn pump(
    mut framed: FramedStream,
    frames_rx: &mut mpsc::Receiver<Vec<u8>>,
    handle: &ChannelHandle,
    shutdown: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            outbound = frames_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if let Err(error) = framed.send(Bytes::from(bytes)).await {
                            debug!(?error, "TCP write failed");
                            return;
                        }
                    }
                    None => return,
                }
            }
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(bytes)) => handle.receive(bytes.to_vec()),
                    Some(Err(error)) => {
                        debug!(?error, "TCP read failed");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

/// Accepts inbound peers on a local address. Each connection becomes one
/// channel that lives exactly as long as the stream.
pub struct TcpListenerAdapter {
    adapter_id: AdapterId,
    bind_addr: String,
    local_addr: Mutex<Option<std::net::SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpListenerAdapter {
    pub fn new(bind_addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            adapter_id: AdapterId::from("tcp-listener"),
            bind_addr: bind_addr.into(),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// The actually bound address, available after `start`. Useful when
    /// binding to port zero.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }
}

#[async_trait]
impl Adapter for TcpListenerAdapter {
    fn adapter_id(&self) -> AdapterId {
        self.adapter_id.clone()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Network
    }

    async fn start(&self, context: AdapterContext) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().expect("local addr lock poisoned") = Some(local_addr);
        info!("Listening on TCP: {local_addr}");

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, peer_addr)) = accepted else {
                    warn!("Error accepting TCP connection");
                    continue;
                };
                info!("Peer dialed us from {peer_addr}");

                let context = context.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let framed = Framed::new(stream, LengthDelimitedCodec::new());
                    let (frames_tx, mut frames_rx) = mpsc::channel(256);
                    let handle = context.add_channel(frames_tx, false);
                    handle.establish();
                    pump(framed, &mut frames_rx, &handle, &shutdown).await;
                    info!("Peer disconnected");
                    handle.remove();
                });
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Dials a remote peer and keeps the connection alive. Transient failures
/// retry with jittered exponential backoff; the channel id is preserved
/// across reconnects, so the peer-level sync state survives.
pub struct TcpClientAdapter {
    adapter_id: AdapterId,
    addr: String,
    backoff_config: BackoffConfig,
    state: Arc<Mutex<ConnectionState>>,
    shutdown: CancellationToken,
}

impl TcpClientAdapter {
    pub fn new(addr: impl Into<String>, backoff_config: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            adapter_id: AdapterId::from("tcp-client"),
            addr: addr.into(),
            backoff_config,
            state: Arc::new(Mutex::new(ConnectionState::Connecting)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().expect("connection state lock poisoned").clone()
    }

    fn set_state(state: &Arc<Mutex<ConnectionState>>, new: ConnectionState) {
        *state.lock().expect("connection state lock poisoned") = new;
    }
}

#[async_trait]
impl Adapter for TcpClientAdapter {
    fn adapter_id(&self) -> AdapterId {
        self.adapter_id.clone()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Network
    }

    async fn start(&self, context: AdapterContext) -> Result<()> {
        let addr = self.addr.clone();
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.backoff_config.clone());

        tokio::spawn(async move {
            let (frames_tx, mut frames_rx) = mpsc::channel(256);
            // One channel for the adapter's lifetime: reconnects to the
            // same peer keep the established sync state.
            let handle = context.add_channel(frames_tx, true);

            loop {
                Self::set_state(&state, ConnectionState::Connecting);
                let connected = tokio::select! {
                    () = shutdown.cancelled() => break,
                    connected = TcpStream::connect(&addr) => connected,
                };
                match connected {
                    Ok(stream) => {
                        info!("Connected to peer at {addr}");
                        backoff.reset();
                        Self::set_state(&state, ConnectionState::Connected);
                        let framed = Framed::new(stream, LengthDelimitedCodec::new());
                        // TCP needs no server-side go-ahead before sending.
                        Self::set_state(&state, ConnectionState::Ready);
                        handle.establish();
                        pump(framed, &mut frames_rx, &handle, &shutdown).await;
                        if shutdown.is_cancelled() {
                            break;
                        }
                        info!("Connection to {addr} lost");
                    }
                    Err(error) => {
                        debug!(?error, "Failed to connect to {addr}");
                    }
                }

                match backoff.next_delay() {
                    Some(delay) => {
                        Self::set_state(
                            &state,
                            ConnectionState::Reconnecting {
                                attempt: backoff.attempt(),
                                next_ms: delay.as_millis() as u64,
                            },
                        );
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        warn!("Reconnect budget for {addr} exhausted, giving up");
                        Self::set_state(
                            &state,
                            ConnectionState::Disconnected {
                                reason: "reconnect budget exhausted".to_string(),
                            },
                        );
                        handle.remove();
                        return;
                    }
                }
            }
            Self::set_state(
                &state,
                ConnectionState::Disconnected {
                    reason: "stopped".to_string(),
                },
            );
            handle.remove();
        });
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
    }
}
