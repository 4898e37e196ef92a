// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Peer transport port.
//!
//! A transport registers the local endpoint under a name, opens connections to
//! other named endpoints and moves opaque byte payloads between them. Every
//! request is non-blocking: outcomes are reported later as [`TransportEvent`]s
//! on the receiver handed out when the transport was created.

use dome_proto::{PeerErrorKind, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half of a transport's event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// What became ready in an [`TransportEvent::Open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// The local endpoint is registered under this name.
    Registered(PeerId),
    /// A connection with this remote endpoint can carry data.
    Connection(PeerId),
}

/// Events delivered by a transport, in per-connection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Registration or connection became ready.
    Open(Opened),
    /// Payload received from `peer`.
    Data {
        /// Sender.
        peer: PeerId,
        /// Opaque bytes.
        payload: Vec<u8>,
    },
    /// Connection with `peer` is gone.
    Close {
        /// Remote end.
        peer: PeerId,
    },
    /// A registration or connection request failed.
    Error(PeerErrorKind),
}

/// Synchronous failures of a transport request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has shut down and accepts no more requests.
    #[error("transport closed")]
    Closed,
    /// No open connection to the peer.
    #[error("no open connection to {0}")]
    NotConnected(PeerId),
    /// Local endpoint has no registered name yet.
    #[error("endpoint is not registered")]
    NotRegistered,
}

impl TransportError {
    /// Error kind surfaced through the join-state callback.
    pub fn kind(&self) -> PeerErrorKind {
        match self {
            TransportError::Closed => PeerErrorKind::Disconnected,
            TransportError::NotConnected(_) => PeerErrorKind::PeerUnavailable,
            TransportError::NotRegistered => PeerErrorKind::Network,
        }
    }
}

/// Requests a peer transport accepts.
pub trait Transport {
    /// Register the local endpoint under `id`, or under a transport-assigned
    /// name when `None`. Answered by `Open(Registered)` or `Error`.
    fn register(&mut self, id: Option<&PeerId>) -> Result<(), TransportError>;

    /// Open a connection to `peer`. Answered by `Open(Connection)` or `Error`.
    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    /// Send one payload over the connection with `peer`.
    fn send(&mut self, peer: &PeerId, payload: &[u8]) -> Result<(), TransportError>;

    /// Tear down the connection with `peer`. Both ends observe `Close`.
    fn close(&mut self, peer: &PeerId) -> Result<(), TransportError>;
}
