// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process transport: a shared rendezvous table plus one event channel per
//! endpoint. Follows the same rules as the broker (unique names, anonymous
//! ids, data only over opened connections, close notifies both ends).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use dome_proto::{PeerErrorKind, PeerId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{EventReceiver, EventSender, Opened, Transport, TransportError, TransportEvent};

type EndpointId = u64;

struct Endpoint {
    name: Option<PeerId>,
    // `None` for names held by `reserve`.
    tx: Option<EventSender>,
    links: BTreeSet<PeerId>,
}

#[derive(Default)]
struct Hub {
    next_endpoint: EndpointId,
    next_anon: u64,
    endpoints: HashMap<EndpointId, Endpoint>,
    names: HashMap<PeerId, EndpointId>,
}

impl Hub {
    fn add(&mut self, name: Option<PeerId>, tx: Option<EventSender>) -> EndpointId {
        let id = self.next_endpoint;
        self.next_endpoint += 1;
        if let Some(name) = &name {
            self.names.insert(name.clone(), id);
        }
        self.endpoints.insert(
            id,
            Endpoint {
                name,
                tx,
                links: BTreeSet::new(),
            },
        );
        id
    }

    fn emit(&self, ep: EndpointId, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(&ep).and_then(|e| e.tx.as_ref()) {
            let _ = tx.send(event);
        }
    }

    fn name_of(&self, ep: EndpointId) -> Option<PeerId> {
        self.endpoints.get(&ep).and_then(|e| e.name.clone())
    }

    fn register(&mut self, ep: EndpointId, requested: Option<&PeerId>) {
        let name = match requested {
            Some(name) => {
                if self.names.get(name).is_some_and(|owner| *owner != ep) {
                    self.emit(ep, TransportEvent::Error(PeerErrorKind::UnavailableId));
                    return;
                }
                name.clone()
            }
            None => loop {
                self.next_anon += 1;
                let candidate = PeerId::new(format!("anon-{}", self.next_anon));
                if !self.names.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        let previous = self
            .endpoints
            .get_mut(&ep)
            .and_then(|e| e.name.replace(name.clone()));
        if let Some(previous) = previous.filter(|p| *p != name) {
            self.names.remove(&previous);
        }
        self.names.insert(name.clone(), ep);
        self.emit(ep, TransportEvent::Open(Opened::Registered(name)));
    }

    fn connect(&mut self, ep: EndpointId, peer: &PeerId) -> Result<(), TransportError> {
        let local = self.name_of(ep).ok_or(TransportError::NotRegistered)?;
        let remote = self
            .names
            .get(peer)
            .copied()
            .filter(|remote| *remote != ep)
            .filter(|remote| self.endpoints.get(remote).is_some_and(|e| e.tx.is_some()));
        let Some(remote) = remote else {
            self.emit(ep, TransportEvent::Error(PeerErrorKind::PeerUnavailable));
            return Ok(());
        };
        if let Some(e) = self.endpoints.get_mut(&ep) {
            e.links.insert(peer.clone());
        }
        if let Some(e) = self.endpoints.get_mut(&remote) {
            e.links.insert(local.clone());
        }
        self.emit(ep, TransportEvent::Open(Opened::Connection(peer.clone())));
        self.emit(remote, TransportEvent::Open(Opened::Connection(local)));
        Ok(())
    }

    fn linked_remote(&self, ep: EndpointId, peer: &PeerId) -> Result<(PeerId, EndpointId), TransportError> {
        let local = self.name_of(ep).ok_or(TransportError::NotRegistered)?;
        let linked = self
            .endpoints
            .get(&ep)
            .is_some_and(|e| e.links.contains(peer));
        match self.names.get(peer) {
            Some(remote) if linked => Ok((local, *remote)),
            _ => Err(TransportError::NotConnected(peer.clone())),
        }
    }

    fn send(&self, ep: EndpointId, peer: &PeerId, payload: &[u8]) -> Result<(), TransportError> {
        let (local, remote) = self.linked_remote(ep, peer)?;
        self.emit(
            remote,
            TransportEvent::Data {
                peer: local,
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }

    fn close(&mut self, ep: EndpointId, peer: &PeerId) -> Result<(), TransportError> {
        let (local, remote) = self.linked_remote(ep, peer)?;
        if let Some(e) = self.endpoints.get_mut(&ep) {
            e.links.remove(peer);
        }
        if let Some(e) = self.endpoints.get_mut(&remote) {
            e.links.remove(&local);
        }
        self.emit(ep, TransportEvent::Close { peer: peer.clone() });
        self.emit(remote, TransportEvent::Close { peer: local });
        Ok(())
    }

    fn disconnect(&mut self, ep: EndpointId) {
        let Some(endpoint) = self.endpoints.remove(&ep) else {
            return;
        };
        let Some(local) = endpoint.name else {
            return;
        };
        self.names.remove(&local);
        for peer in endpoint.links {
            if let Some(remote) = self.names.get(&peer).copied() {
                if let Some(e) = self.endpoints.get_mut(&remote) {
                    e.links.remove(&local);
                }
                self.emit(remote, TransportEvent::Close { peer: local.clone() });
            }
        }
        debug!(peer = %local, "memory endpoint dropped");
    }
}

/// Shared in-process rendezvous. Cheap to clone; all clones see the same
/// names and connections.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new unregistered endpoint and its event stream.
    pub fn endpoint(&self) -> (MemoryTransport, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = match self.hub.lock() {
            Ok(mut hub) => hub.add(None, Some(tx)),
            // A poisoned hub rejects every later request with `Closed`.
            Err(_) => EndpointId::MAX,
        };
        (
            MemoryTransport {
                network: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Hold `name` without an endpoint behind it, as another display running
    /// elsewhere would. Returns `false` if the name is already taken.
    pub fn reserve(&self, name: &PeerId) -> bool {
        let Ok(mut hub) = self.hub.lock() else {
            return false;
        };
        if hub.names.contains_key(name) {
            return false;
        }
        hub.add(Some(name.clone()), None);
        true
    }

    /// Whether `name` is currently registered.
    pub fn is_registered(&self, name: &PeerId) -> bool {
        self.hub
            .lock()
            .map(|hub| hub.names.contains_key(name))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Hub>, TransportError> {
        self.hub.lock().map_err(|_| TransportError::Closed)
    }
}

/// One endpoint on a [`MemoryNetwork`]. Dropping it closes all of its
/// connections and releases its name.
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: EndpointId,
}

impl MemoryTransport {
    /// Name this endpoint is registered under, if any.
    pub fn local_id(&self) -> Option<PeerId> {
        self.network.lock().ok().and_then(|hub| hub.name_of(self.id))
    }
}

impl Transport for MemoryTransport {
    fn register(&mut self, id: Option<&PeerId>) -> Result<(), TransportError> {
        let mut hub = self.network.lock()?;
        if !hub.endpoints.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        hub.register(self.id, id);
        Ok(())
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.network.lock()?.connect(self.id, peer)
    }

    fn send(&mut self, peer: &PeerId, payload: &[u8]) -> Result<(), TransportError> {
        self.network.lock()?.send(self.id, peer, payload)
    }

    fn close(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.network.lock()?.close(self.id, peer)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.network.hub.lock() {
            hub.disconnect(self.id);
        }
    }
}
