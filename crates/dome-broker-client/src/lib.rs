// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! [`Transport`] over TCP to `dome-broker` (CBOR-framed).
//!
//! Requests are queued to a writer task; a reader task decodes broker frames
//! into [`TransportEvent`]s. When the broker goes away the event stream
//! yields `Error(Disconnected)` and then ends.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use dome_interact::{EventReceiver, EventSender, Opened, Transport, TransportError, TransportEvent};
use dome_proto::wire::{encode_message, FrameReader};
use dome_proto::{BrokerMessage, PeerErrorKind, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Broker-backed peer transport.
#[derive(Debug, Clone)]
pub struct BrokerTransport {
    outbox: mpsc::UnboundedSender<BrokerMessage>,
    api_key: String,
}

impl BrokerTransport {
    /// Connect to the broker at `addr`, authenticating registrations with `api_key`.
    pub async fn connect(addr: SocketAddr, api_key: impl Into<String>) -> Result<(Self, EventReceiver)> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to broker at {addr}"))?;
        stream.set_nodelay(true)?;
        info!(%addr, "connected to broker");
        Ok(Self::from_stream(stream, api_key))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, api_key: impl Into<String>) -> (Self, EventReceiver) {
        let (read_half, write_half) = stream.into_split();
        let (outbox, queued) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write_half, queued));
        tokio::spawn(read_loop(read_half, events_tx));
        (
            Self {
                outbox,
                api_key: api_key.into(),
            },
            events_rx,
        )
    }

    fn enqueue(&self, msg: BrokerMessage) -> Result<(), TransportError> {
        self.outbox.send(msg).map_err(|_| TransportError::Closed)
    }
}

impl Transport for BrokerTransport {
    fn register(&mut self, id: Option<&PeerId>) -> Result<(), TransportError> {
        self.enqueue(BrokerMessage::Register {
            key: self.api_key.clone(),
            id: id.cloned(),
        })
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.enqueue(BrokerMessage::Connect { peer: peer.clone() })
    }

    fn send(&mut self, peer: &PeerId, payload: &[u8]) -> Result<(), TransportError> {
        self.enqueue(BrokerMessage::Data {
            peer: peer.clone(),
            payload: payload.to_vec(),
        })
    }

    fn close(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.enqueue(BrokerMessage::Close { peer: peer.clone() })
    }
}

/// Map a broker frame to the event it reports, if any.
pub fn to_transport_event(msg: BrokerMessage) -> Option<TransportEvent> {
    match msg {
        BrokerMessage::Registered { id } => Some(TransportEvent::Open(Opened::Registered(id))),
        BrokerMessage::Opened { peer } => Some(TransportEvent::Open(Opened::Connection(peer))),
        BrokerMessage::Data { peer, payload } => Some(TransportEvent::Data { peer, payload }),
        BrokerMessage::Close { peer } => Some(TransportEvent::Close { peer }),
        BrokerMessage::Error { kind, detail } => {
            if let Some(detail) = detail {
                debug!(%kind, %detail, "broker error");
            }
            Some(TransportEvent::Error(kind))
        }
        other @ (BrokerMessage::Register { .. } | BrokerMessage::Connect { .. }) => {
            warn!(op = other.op_name(), "unexpected request from broker");
            None
        }
    }
}

async fn write_loop(mut stream: OwnedWriteHalf, mut queued: mpsc::UnboundedReceiver<BrokerMessage>) {
    while let Some(msg) = queued.recv().await {
        let frame = match encode_message(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(op = msg.op_name(), ?err, "dropping unencodable request");
                continue;
            }
        };
        if let Err(err) = stream.write_all(&frame).await {
            warn!(?err, "broker write failed");
            break;
        }
    }
    let _ = stream.shutdown().await;
}

async fn read_loop(mut stream: OwnedReadHalf, events: EventSender) {
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; 8 * 1024];
    'read: loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(?err, "broker read failed");
                break;
            }
        };
        reader.push(&buf[..n]);
        loop {
            match reader.next_message() {
                Ok(Some(msg)) => {
                    if let Some(event) = to_transport_event(msg) {
                        if events.send(event).is_err() {
                            break 'read;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "broker sent a bad frame; dropping connection");
                    break 'read;
                }
            }
        }
    }
    info!("broker connection closed");
    let _ = events.send(TransportEvent::Error(PeerErrorKind::Disconnected));
}
