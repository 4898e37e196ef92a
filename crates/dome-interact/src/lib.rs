// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Smartphone-to-dome interaction layer.
//!
//! A master display registers under a well-known room id and accepts
//! connections from participant phones. Each phone streams
//! [`ParticipantEvent`]s; the master turns every stream into a pointing vector
//! plus debounced touch gestures and hands them to scene callbacks.
//!
//! Layers, leaf first:
//! - [`transport`]: the peer transport port ([`Transport`] + [`TransportEvent`]),
//!   with an in-process implementation in [`memory`].
//! - [`comms`]: [`PeerCommunications`], join/retry and the live connection set.
//! - [`gesture`]: [`GestureTracker`], tap/hold debounce and pointing vectors.
//! - [`registry`]: [`ParticipantRegistry`], identity → participant ownership.
//! - [`interaction`]: [`DomeInteraction`], the master-side event loop.
//! - [`remote`]: [`RemoteControl`], the participant side.

pub mod comms;
pub mod config;
pub mod gesture;
pub mod interaction;
pub mod memory;
pub mod registry;
pub mod remote;
pub mod transport;

pub use comms::{CommsListener, JoinState, PeerCommunications, Role, JOIN_RETRY_DELAY};
pub use config::InteractionConfig;
pub use dome_proto::{ParticipantEvent, PeerErrorKind, PeerId};
pub use gesture::{GestureTracker, PointerEvent, TouchEdge, TouchState, DEBOUNCE_WINDOW};
pub use interaction::DomeInteraction;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use registry::{Participant, ParticipantRegistry};
pub use remote::RemoteControl;
pub use transport::{EventReceiver, EventSender, Opened, Transport, TransportError, TransportEvent};
