// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Broker state: registered names, links between peers, per-connection outboxes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use dome_proto::wire::encode_message;
use dome_proto::{BrokerMessage, PeerErrorKind, PeerId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub(crate) type Hub = Arc<Mutex<HubState>>;

const MAX_ID_LEN: usize = 64;

pub(crate) struct ConnState {
    name: Option<PeerId>,
    links: BTreeSet<PeerId>,
    tx: mpsc::Sender<Vec<u8>>,
}

pub(crate) struct HubState {
    api_key: String,
    next_conn_id: u64,
    conns: HashMap<u64, ConnState>,
    names: HashMap<PeerId, u64>,
}

/// Names are 1..=64 characters of ASCII letters, digits, `-` and `_`.
pub(crate) fn valid_peer_id(id: &PeerId) -> bool {
    let s = id.as_str();
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl HubState {
    pub(crate) fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            next_conn_id: 0,
            conns: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub(crate) fn add_conn(&mut self, tx: mpsc::Sender<Vec<u8>>) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(
            id,
            ConnState {
                name: None,
                links: BTreeSet::new(),
                tx,
            },
        );
        id
    }

    fn name_of(&self, conn_id: u64) -> Option<PeerId> {
        self.conns.get(&conn_id).and_then(|c| c.name.clone())
    }

    // Outboxes are bounded; a client that stops reading loses frames.
    fn send_to(&self, conn_id: u64, msg: &BrokerMessage) -> Result<()> {
        let Some(conn) = self.conns.get(&conn_id) else {
            return Ok(());
        };
        let pkt = encode_message(msg)?;
        match conn.tx.try_send(pkt) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(conn_id, op = msg.op_name(), "outbox full; dropping"),
            Err(TrySendError::Closed(_)) => debug!(conn_id, "outbox closed"),
        }
        Ok(())
    }

    fn fail(&self, conn_id: u64, kind: PeerErrorKind, detail: &str) -> Result<()> {
        debug!(conn_id, %kind, detail, "rejecting request");
        self.send_to(
            conn_id,
            &BrokerMessage::Error {
                kind,
                detail: Some(detail.to_owned()),
            },
        )
    }

    fn anonymous_id(&self) -> PeerId {
        loop {
            let id = PeerId::new(format!("{:016x}", rand::random::<u64>()));
            if !self.names.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn register(&mut self, conn_id: u64, key: &str, requested: Option<&PeerId>) -> Result<()> {
        if key != self.api_key {
            return self.fail(conn_id, PeerErrorKind::InvalidKey, "api key rejected");
        }
        let name = match requested {
            Some(id) if !valid_peer_id(id) => {
                return self.fail(conn_id, PeerErrorKind::InvalidId, "malformed id");
            }
            Some(id) if self.names.get(id).is_some_and(|owner| *owner != conn_id) => {
                return self.fail(conn_id, PeerErrorKind::UnavailableId, "id is taken");
            }
            Some(id) => id.clone(),
            None => self.anonymous_id(),
        };
        let previous = self
            .conns
            .get_mut(&conn_id)
            .and_then(|c| c.name.replace(name.clone()));
        if let Some(previous) = previous.filter(|p| *p != name) {
            self.names.remove(&previous);
        }
        self.names.insert(name.clone(), conn_id);
        info!(conn_id, peer = %name, "registered");
        self.send_to(conn_id, &BrokerMessage::Registered { id: name })
    }

    pub(crate) fn connect(&mut self, conn_id: u64, peer: &PeerId) -> Result<()> {
        let Some(local) = self.name_of(conn_id) else {
            return self.fail(conn_id, PeerErrorKind::Network, "register before connecting");
        };
        let Some(remote) = self.names.get(peer).copied().filter(|r| *r != conn_id) else {
            return self.fail(conn_id, PeerErrorKind::PeerUnavailable, "no such peer");
        };
        if let Some(c) = self.conns.get_mut(&conn_id) {
            c.links.insert(peer.clone());
        }
        if let Some(c) = self.conns.get_mut(&remote) {
            c.links.insert(local.clone());
        }
        info!(from = %local, to = %peer, "connection opened");
        self.send_to(conn_id, &BrokerMessage::Opened { peer: peer.clone() })?;
        self.send_to(remote, &BrokerMessage::Opened { peer: local })
    }

    fn linked(&self, conn_id: u64, peer: &PeerId) -> Option<(PeerId, u64)> {
        let conn = self.conns.get(&conn_id)?;
        let local = conn.name.clone()?;
        if !conn.links.contains(peer) {
            return None;
        }
        self.names.get(peer).map(|remote| (local, *remote))
    }

    pub(crate) fn relay(&self, conn_id: u64, peer: &PeerId, payload: Vec<u8>) -> Result<()> {
        let Some((local, remote)) = self.linked(conn_id, peer) else {
            debug!(conn_id, to = %peer, "dropping data without a connection");
            return Ok(());
        };
        self.send_to(remote, &BrokerMessage::Data { peer: local, payload })
    }

    pub(crate) fn close(&mut self, conn_id: u64, peer: &PeerId) -> Result<()> {
        let Some((local, remote)) = self.linked(conn_id, peer) else {
            return Ok(());
        };
        if let Some(c) = self.conns.get_mut(&conn_id) {
            c.links.remove(peer);
        }
        if let Some(c) = self.conns.get_mut(&remote) {
            c.links.remove(&local);
        }
        self.send_to(conn_id, &BrokerMessage::Close { peer: peer.clone() })?;
        self.send_to(remote, &BrokerMessage::Close { peer: local })
    }

    /// Drop a connection: release its name and close its links.
    pub(crate) fn remove_conn(&mut self, conn_id: u64) -> Result<()> {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return Ok(());
        };
        let Some(local) = conn.name else {
            return Ok(());
        };
        self.names.remove(&local);
        for peer in conn.links {
            if let Some(remote) = self.names.get(&peer).copied() {
                if let Some(c) = self.conns.get_mut(&remote) {
                    c.links.remove(&local);
                }
                self.send_to(remote, &BrokerMessage::Close { peer: local.clone() })?;
            }
        }
        info!(conn_id, peer = %local, "peer left");
        Ok(())
    }
}

/// Handle a single inbound message from a connection.
pub(crate) async fn handle_message(msg: BrokerMessage, conn_id: u64, hub: &Hub) -> Result<()> {
    let mut h = hub.lock().await;
    match msg {
        BrokerMessage::Register { key, id } => h.register(conn_id, &key, id.as_ref()),
        BrokerMessage::Connect { peer } => h.connect(conn_id, &peer),
        BrokerMessage::Data { peer, payload } => h.relay(conn_id, &peer, payload),
        BrokerMessage::Close { peer } => h.close(conn_id, &peer),
        other @ (BrokerMessage::Registered { .. }
        | BrokerMessage::Opened { .. }
        | BrokerMessage::Error { .. }) => {
            warn!(conn_id, op = other.op_name(), "ignoring broker-only message from client");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use dome_proto::wire::decode_message;

    const KEY: &str = "test-key";

    fn hub() -> Hub {
        Arc::new(Mutex::new(HubState::new(KEY)))
    }

    async fn add_conn(hub: &Hub) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let id = hub.lock().await.add_conn(tx);
        (id, rx)
    }

    fn next(rx: &mut mpsc::Receiver<Vec<u8>>) -> Option<BrokerMessage> {
        rx.try_recv().ok().map(|pkt| decode_message(&pkt).unwrap().0)
    }

    fn register(id: Option<&str>) -> BrokerMessage {
        BrokerMessage::Register {
            key: KEY.into(),
            id: id.map(PeerId::from),
        }
    }

    fn error_kind(msg: Option<BrokerMessage>) -> Option<PeerErrorKind> {
        match msg {
            Some(BrokerMessage::Error { kind, .. }) => Some(kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn names_are_unique() {
        let hub = hub();
        let (a, mut rx_a) = add_conn(&hub).await;
        let (b, mut rx_b) = add_conn(&hub).await;
        handle_message(register(Some("demo")), a, &hub).await.unwrap();
        handle_message(register(Some("demo")), b, &hub).await.unwrap();
        assert_eq!(
            next(&mut rx_a),
            Some(BrokerMessage::Registered { id: PeerId::from("demo") })
        );
        assert_eq!(error_kind(next(&mut rx_b)), Some(PeerErrorKind::UnavailableId));
    }

    #[tokio::test]
    async fn wrong_key_and_bad_ids_are_rejected() {
        let hub = hub();
        let (a, mut rx) = add_conn(&hub).await;
        handle_message(
            BrokerMessage::Register {
                key: "nope".into(),
                id: None,
            },
            a,
            &hub,
        )
        .await
        .unwrap();
        assert_eq!(error_kind(next(&mut rx)), Some(PeerErrorKind::InvalidKey));

        handle_message(register(Some("has space")), a, &hub).await.unwrap();
        assert_eq!(error_kind(next(&mut rx)), Some(PeerErrorKind::InvalidId));
    }

    #[tokio::test]
    async fn anonymous_registration_gets_a_fresh_id() {
        let hub = hub();
        let (a, mut rx) = add_conn(&hub).await;
        handle_message(register(None), a, &hub).await.unwrap();
        match next(&mut rx) {
            Some(BrokerMessage::Registered { id }) => assert!(valid_peer_id(&id)),
            other => panic!("expected registration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_is_relayed_only_between_linked_peers() {
        let hub = hub();
        let (master, mut rx_m) = add_conn(&hub).await;
        let (phone, mut rx_p) = add_conn(&hub).await;
        handle_message(register(Some("demo")), master, &hub).await.unwrap();
        handle_message(register(Some("phone")), phone, &hub).await.unwrap();
        next(&mut rx_m);
        next(&mut rx_p);

        let early = BrokerMessage::Data {
            peer: PeerId::from("demo"),
            payload: b"early".to_vec(),
        };
        handle_message(early, phone, &hub).await.unwrap();
        assert_eq!(next(&mut rx_m), None);

        handle_message(BrokerMessage::Connect { peer: PeerId::from("demo") }, phone, &hub)
            .await
            .unwrap();
        assert_eq!(next(&mut rx_p), Some(BrokerMessage::Opened { peer: PeerId::from("demo") }));
        assert_eq!(next(&mut rx_m), Some(BrokerMessage::Opened { peer: PeerId::from("phone") }));

        let data = BrokerMessage::Data {
            peer: PeerId::from("demo"),
            payload: b"hi".to_vec(),
        };
        handle_message(data, phone, &hub).await.unwrap();
        assert_eq!(
            next(&mut rx_m),
            Some(BrokerMessage::Data {
                peer: PeerId::from("phone"),
                payload: b"hi".to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn dialing_requires_registration_and_a_live_target() {
        let hub = hub();
        let (a, mut rx) = add_conn(&hub).await;
        handle_message(BrokerMessage::Connect { peer: PeerId::from("demo") }, a, &hub)
            .await
            .unwrap();
        assert_eq!(error_kind(next(&mut rx)), Some(PeerErrorKind::Network));

        handle_message(register(None), a, &hub).await.unwrap();
        next(&mut rx);
        handle_message(BrokerMessage::Connect { peer: PeerId::from("demo") }, a, &hub)
            .await
            .unwrap();
        assert_eq!(error_kind(next(&mut rx)), Some(PeerErrorKind::PeerUnavailable));
    }

    #[tokio::test]
    async fn leaving_closes_links_and_frees_the_name() {
        let hub = hub();
        let (master, mut rx_m) = add_conn(&hub).await;
        let (phone, _rx_p) = add_conn(&hub).await;
        handle_message(register(Some("demo")), master, &hub).await.unwrap();
        handle_message(register(Some("phone")), phone, &hub).await.unwrap();
        handle_message(BrokerMessage::Connect { peer: PeerId::from("demo") }, phone, &hub)
            .await
            .unwrap();
        while next(&mut rx_m).is_some() {}

        hub.lock().await.remove_conn(phone).unwrap();
        assert_eq!(next(&mut rx_m), Some(BrokerMessage::Close { peer: PeerId::from("phone") }));

        let (again, mut rx_again) = add_conn(&hub).await;
        handle_message(register(Some("phone")), again, &hub).await.unwrap();
        assert_eq!(
            next(&mut rx_again),
            Some(BrokerMessage::Registered { id: PeerId::from("phone") })
        );
    }

    #[tokio::test]
    async fn explicit_close_notifies_both_ends() {
        let hub = hub();
        let (master, mut rx_m) = add_conn(&hub).await;
        let (phone, mut rx_p) = add_conn(&hub).await;
        handle_message(register(Some("demo")), master, &hub).await.unwrap();
        handle_message(register(Some("phone")), phone, &hub).await.unwrap();
        handle_message(BrokerMessage::Connect { peer: PeerId::from("demo") }, phone, &hub)
            .await
            .unwrap();
        while next(&mut rx_m).is_some() {}
        while next(&mut rx_p).is_some() {}

        handle_message(BrokerMessage::Close { peer: PeerId::from("phone") }, master, &hub)
            .await
            .unwrap();
        assert_eq!(next(&mut rx_m), Some(BrokerMessage::Close { peer: PeerId::from("phone") }));
        assert_eq!(next(&mut rx_p), Some(BrokerMessage::Close { peer: PeerId::from("demo") }));
    }
}
