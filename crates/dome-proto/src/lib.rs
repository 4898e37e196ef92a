// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for dome interaction: peer identities, the participant payload
//! streamed by phones, and the broker frames used by the relay transport.
//!
//! Broker frames travel in checksummed packets (see [`wire`]); participant
//! payloads are plain JSON carried opaquely inside `Data` frames (see
//! [`payload`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

pub mod payload;
pub mod wire;

pub use payload::{decode_event, encode_event, ParticipantEvent, PayloadError};

/// Default TCP address of the dome broker.
pub fn default_broker_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

/// Opaque name of a connection endpoint.
///
/// The master registers under a room id (`<prefix><suffix>`); participants get
/// an id assigned by the broker. Ids never change after registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Error kinds reported by a transport.
///
/// The string forms match the identifiers used by deployed peer clients, so
/// they can be shown to users and logged verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerErrorKind {
    /// The requested registration name is already taken.
    UnavailableId,
    /// The dialed peer is not registered.
    PeerUnavailable,
    /// The API key was rejected.
    InvalidKey,
    /// The requested name is malformed.
    InvalidId,
    /// Lower-level network failure.
    Network,
    /// The broker failed to process a request.
    ServerError,
    /// The link to the broker is gone.
    Disconnected,
}

impl PeerErrorKind {
    /// Stable identifier (e.g. `"unavailable-id"`).
    pub fn as_str(self) -> &'static str {
        match self {
            PeerErrorKind::UnavailableId => "unavailable-id",
            PeerErrorKind::PeerUnavailable => "peer-unavailable",
            PeerErrorKind::InvalidKey => "invalid-key",
            PeerErrorKind::InvalidId => "invalid-id",
            PeerErrorKind::Network => "network",
            PeerErrorKind::ServerError => "server-error",
            PeerErrorKind::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for PeerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames exchanged between a peer and the broker.
///
/// `Data.peer` and `Close.peer` name the destination when sent by a client and
/// the source when delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Claim a name (`Some`) or ask for an anonymous one (`None`).
    Register {
        /// API key shared by every endpoint of an installation.
        key: String,
        /// Requested name.
        id: Option<PeerId>,
    },
    /// Registration accepted under `id`.
    Registered {
        /// Name now owned by the client.
        id: PeerId,
    },
    /// Open a connection to a registered peer.
    Connect {
        /// Name to dial.
        peer: PeerId,
    },
    /// A connection with `peer` is ready for data.
    Opened {
        /// Remote end of the connection.
        peer: PeerId,
    },
    /// Application payload.
    Data {
        /// Destination (client → broker) or source (broker → client).
        peer: PeerId,
        /// Opaque bytes.
        payload: Vec<u8>,
    },
    /// Connection teardown.
    Close {
        /// Remote end of the connection.
        peer: PeerId,
    },
    /// A request failed.
    Error {
        /// What went wrong.
        kind: PeerErrorKind,
        /// Optional human-readable detail.
        detail: Option<String>,
    },
}

impl BrokerMessage {
    /// Short op name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            BrokerMessage::Register { .. } => "register",
            BrokerMessage::Registered { .. } => "registered",
            BrokerMessage::Connect { .. } => "connect",
            BrokerMessage::Opened { .. } => "opened",
            BrokerMessage::Data { .. } => "data",
            BrokerMessage::Close { .. } => "close",
            BrokerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn error_kinds_serialize_as_peer_library_strings() {
        let json = serde_json::to_string(&PeerErrorKind::UnavailableId).unwrap();
        assert_eq!(json, "\"unavailable-id\"");
        let back: PeerErrorKind = serde_json::from_str("\"peer-unavailable\"").unwrap();
        assert_eq!(back, PeerErrorKind::PeerUnavailable);
        assert_eq!(PeerErrorKind::ServerError.to_string(), "server-error");
    }

    #[test]
    fn peer_id_is_transparent() {
        let id = PeerId::from("domeInteraction1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"domeInteraction1\"");
        assert_eq!(id.to_string(), "domeInteraction1");
    }
}
