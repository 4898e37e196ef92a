// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Peer mesh management: joining as master or participant, master room-id
//! collision retry, the live connection set and best-effort broadcast.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use dome_proto::{PeerErrorKind, PeerId};
use tracing::{debug, info, warn};

use crate::transport::{Opened, Transport, TransportError, TransportEvent};

/// Delay before a master retries registration with the next instance suffix.
///
/// Deployed masters use the same value; keep it in sync.
pub const JOIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Which side of the mesh this endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Registers under the room id and accepts connections.
    Master,
    /// Registers anonymously and dials the master.
    Participant,
}

/// Join-state notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Local registration succeeded.
    Open,
    /// A connection became ready.
    Connected,
    /// A request failed; terminal for the join attempt it belongs to.
    Error(PeerErrorKind),
}

impl JoinState {
    /// `"open"`, `"connected"` or `"error"`.
    pub fn as_str(self) -> &'static str {
        match self {
            JoinState::Open => "open",
            JoinState::Connected => "connected",
            JoinState::Error(_) => "error",
        }
    }

    /// Error kind, present only for [`JoinState::Error`].
    pub fn info(self) -> Option<PeerErrorKind> {
        match self {
            JoinState::Error(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinState::Error(kind) => write!(f, "error ({kind})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Receives what [`PeerCommunications`] observes. All methods default to no-ops.
pub trait CommsListener {
    /// Join-state change.
    fn state_changed(&mut self, _state: JoinState) {}
    /// A connection with `peer` is ready.
    fn connection_opened(&mut self, _peer: &PeerId) {}
    /// Payload from `peer`, received at `at`.
    fn received_data(&mut self, _payload: &[u8], _peer: &PeerId, _at: Instant) {}
    /// Connection with `peer` closed.
    fn connection_closed(&mut self, _peer: &PeerId) {}
}

impl CommsListener for () {}

/// Room id for `prefix` and an optional instance suffix.
pub fn room_id(prefix: &str, instance: Option<u32>) -> PeerId {
    match instance {
        Some(n) => PeerId::new(format!("{prefix}{n}")),
        None => PeerId::new(prefix),
    }
}

/// Instance suffix carried by a join URL (`...#3` → `Some(3)`).
///
/// Only a trailing run of digits after the last `#` counts.
pub fn instance_from_url(url: &str) -> Option<u32> {
    let (_, fragment) = url.rsplit_once('#')?;
    if fragment.is_empty() || !fragment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    fragment.parse().ok()
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    role: Role,
    instance: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    at: Instant,
    instance: u32,
}

/// One local identity on the peer mesh.
///
/// Driven from a single task: requests go out through the transport, and the
/// transport's events come back in through [`handle_event`](Self::handle_event).
/// Scheduled master retries fire from [`poll_retry`](Self::poll_retry).
pub struct PeerCommunications<T> {
    transport: T,
    room_prefix: String,
    attempt: Option<Attempt>,
    retry: Option<Retry>,
    local_id: Option<PeerId>,
    role: Option<Role>,
    instance: Option<u32>,
    connections: BTreeSet<PeerId>,
}

impl<T: Transport> PeerCommunications<T> {
    /// Wrap a transport; nothing is sent until [`join`](Self::join).
    pub fn new(transport: T, room_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            room_prefix: room_prefix.into(),
            attempt: None,
            retry: None,
            local_id: None,
            role: None,
            instance: None,
            connections: BTreeSet::new(),
        }
    }

    /// Start joining.
    ///
    /// A master registers as `room_prefix + instance`. A participant registers
    /// anonymously and dials that room once.
    pub fn join(&mut self, role: Role, instance: Option<u32>, listener: &mut impl CommsListener) {
        let room = room_id(&self.room_prefix, instance);
        info!(%room, ?role, "attempting to join");
        self.attempt = Some(Attempt { role, instance });

        let requested = match role {
            Role::Master => self.transport.register(Some(&room)),
            Role::Participant => self
                .transport
                .register(None)
                .and_then(|()| self.transport.connect(&room)),
        };
        if let Err(err) = requested {
            warn!(%room, %err, "join request failed");
            self.attempt = None;
            listener.state_changed(JoinState::Error(err.kind()));
        }
    }

    /// Feed one transport event.
    pub fn handle_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        listener: &mut impl CommsListener,
    ) {
        match event {
            TransportEvent::Open(Opened::Registered(id)) => {
                info!(peer = %id, "registered");
                let attempt = self.attempt.take();
                self.role = attempt.map(|a| a.role);
                self.instance = attempt.and_then(|a| a.instance);
                self.local_id = Some(id);
                listener.state_changed(JoinState::Open);
            }
            TransportEvent::Open(Opened::Connection(peer)) => {
                info!(%peer, "accepting connection");
                self.connections.insert(peer.clone());
                listener.connection_opened(&peer);
                listener.state_changed(JoinState::Connected);
            }
            TransportEvent::Data { peer, payload } => {
                if !self.connections.contains(&peer) {
                    debug!(%peer, "dropping data without an open connection");
                    return;
                }
                listener.received_data(&payload, &peer, now);
            }
            TransportEvent::Close { peer } => {
                info!(%peer, "peer closed connection");
                self.connections.remove(&peer);
                listener.connection_closed(&peer);
            }
            TransportEvent::Error(kind) => self.handle_error(kind, now, listener),
        }
    }

    fn handle_error(&mut self, kind: PeerErrorKind, now: Instant, listener: &mut impl CommsListener) {
        match self.attempt.take() {
            Some(Attempt {
                role: Role::Master,
                instance,
            }) if kind == PeerErrorKind::UnavailableId => {
                let next = instance.map_or(1, |n| n.saturating_add(1));
                debug!(next, "room id taken; retrying with next instance suffix");
                self.retry = Some(Retry {
                    at: now + JOIN_RETRY_DELAY,
                    instance: next,
                });
            }
            _ => {
                warn!(error = %kind, "transport error");
                listener.state_changed(JoinState::Error(kind));
            }
        }
    }

    /// When the pending master retry is due, if one is scheduled.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry.map(|r| r.at)
    }

    /// Fire the pending master retry if it is due. Returns whether it fired.
    pub fn poll_retry(&mut self, now: Instant, listener: &mut impl CommsListener) -> bool {
        match self.retry {
            Some(retry) if retry.at <= now => {
                self.retry = None;
                self.join(Role::Master, Some(retry.instance), listener);
                true
            }
            _ => false,
        }
    }

    /// Send `payload` to every live connection. Failures are logged and
    /// otherwise ignored.
    pub fn send_to_all(&mut self, payload: &[u8]) {
        for peer in &self.connections {
            if let Err(err) = self.transport.send(peer, payload) {
                debug!(%peer, %err, "send failed");
            }
        }
    }

    /// Close the connection with `peer`; the transport reports the `Close`.
    pub fn disconnect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.transport.close(peer)
    }

    /// `"#N"` when registration used instance suffix `N`, else empty.
    pub fn url_suffix(&self) -> String {
        self.instance
            .map_or_else(String::new, |n| format!("#{n}"))
    }

    /// Registered local identity.
    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// Role of the successful registration.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Whether registration has succeeded.
    pub fn is_joined(&self) -> bool {
        self.local_id.is_some()
    }

    /// Instance suffix of the successful registration.
    pub fn instance(&self) -> Option<u32> {
        self.instance
    }

    /// Room prefix this endpoint joins under.
    pub fn room_prefix(&self) -> &str {
        &self.room_prefix
    }

    /// Live connections, sorted by peer id.
    pub fn connections(&self) -> impl Iterator<Item = &PeerId> {
        self.connections.iter()
    }

    /// Whether a connection with `peer` is live.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.contains(peer)
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
