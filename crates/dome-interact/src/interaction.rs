// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Master-side interaction: peer mesh + participant registry + frame ticks.

use std::fmt;
use std::time::{Duration, Instant};

use dome_proto::{decode_event, PeerId};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::comms::{CommsListener, JoinState, PeerCommunications, Role};
use crate::config::InteractionConfig;
use crate::registry::{Participant, ParticipantRegistry};
use crate::transport::{EventReceiver, Transport, TransportEvent};

type StateHook = Box<dyn FnMut(JoinState)>;

/// Current time on tokio's clock, so paused-clock tests see virtual time.
pub(crate) fn clock_now() -> Instant {
    time::Instant::now().into_std()
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// A master display: owns the peer mesh and every participant.
pub struct DomeInteraction<T, P, F> {
    comms: PeerCommunications<T>,
    registry: ParticipantRegistry<P, F>,
    epoch: Instant,
    state: Option<JoinState>,
    on_state: Option<StateHook>,
}

struct Inbound<'a, P, F> {
    registry: &'a mut ParticipantRegistry<P, F>,
    epoch: Instant,
    state: &'a mut Option<JoinState>,
    on_state: &'a mut Option<StateHook>,
}

impl<P, F> CommsListener for Inbound<'_, P, F>
where
    P: Participant,
    F: FnMut(&PeerId) -> P,
{
    fn state_changed(&mut self, state: JoinState) {
        *self.state = Some(state);
        if let Some(hook) = self.on_state.as_mut() {
            hook(state);
        }
    }

    fn connection_opened(&mut self, peer: &PeerId) {
        self.registry.on_connection_opened(peer);
    }

    fn received_data(&mut self, payload: &[u8], peer: &PeerId, at: Instant) {
        match decode_event(payload) {
            Ok(event) => {
                let t = at.saturating_duration_since(self.epoch).as_secs_f64();
                self.registry.on_received_data(peer, &event, t);
            }
            Err(err) => warn!(%peer, %err, "dropping undecodable participant payload"),
        }
    }

    fn connection_closed(&mut self, peer: &PeerId) {
        self.registry.on_connection_closed(peer);
    }
}

impl<T, P, F> DomeInteraction<T, P, F>
where
    T: Transport,
    P: Participant,
    F: FnMut(&PeerId) -> P,
{
    /// Master over `transport`, building participants with `factory`.
    pub fn new(transport: T, config: &InteractionConfig, factory: F) -> Self {
        Self {
            comms: PeerCommunications::new(transport, config.peer_prefix.clone()),
            registry: ParticipantRegistry::new(factory, config.inclination_quat()),
            epoch: clock_now(),
            state: None,
            on_state: None,
        }
    }

    /// Observe join-state changes.
    pub fn on_state_changed(&mut self, hook: impl FnMut(JoinState) + 'static) {
        self.on_state = Some(Box::new(hook));
    }

    fn split(&mut self) -> (&mut PeerCommunications<T>, Inbound<'_, P, F>) {
        (
            &mut self.comms,
            Inbound {
                registry: &mut self.registry,
                epoch: self.epoch,
                state: &mut self.state,
                on_state: &mut self.on_state,
            },
        )
    }

    /// Register as master under the bare room id, probing suffixes on collision.
    pub fn join(&mut self) {
        let (comms, mut inbound) = self.split();
        comms.join(Role::Master, None, &mut inbound);
    }

    /// Feed one transport event observed at `now`.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        let (comms, mut inbound) = self.split();
        comms.handle_event(event, now, &mut inbound);
    }

    /// Fire a due registration retry. Returns whether one fired.
    pub fn poll_retry(&mut self, now: Instant) -> bool {
        let (comms, mut inbound) = self.split();
        comms.poll_retry(now, &mut inbound)
    }

    /// Next time [`poll_retry`](Self::poll_retry) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.comms.next_retry_at()
    }

    /// Tick every participant.
    pub fn animate(&mut self, t: f64, dt: f64) {
        self.registry.animate(t, dt);
    }

    /// Seconds between construction and `now`.
    pub fn elapsed(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.epoch).as_secs_f64()
    }

    /// `"#N"` when the room needed instance suffix `N`.
    pub fn url_suffix(&self) -> String {
        self.comms.url_suffix()
    }

    /// `base` with the instance suffix appended.
    pub fn join_url(&self, base: &str) -> String {
        format!("{base}{}", self.url_suffix())
    }

    /// Latest join state.
    pub fn state(&self) -> Option<JoinState> {
        self.state
    }

    /// Participants.
    pub fn registry(&self) -> &ParticipantRegistry<P, F> {
        &self.registry
    }

    /// Participants, mutably.
    pub fn registry_mut(&mut self) -> &mut ParticipantRegistry<P, F> {
        &mut self.registry
    }

    /// Peer mesh.
    pub fn comms(&self) -> &PeerCommunications<T> {
        &self.comms
    }

    /// Join and process events until registration succeeds or fails.
    ///
    /// Returns `None` if the event stream ends first. Connections that open
    /// meanwhile are handled as usual.
    #[allow(clippy::future_not_send)]
    pub async fn join_and_wait(&mut self, events: &mut EventReceiver) -> Option<JoinState> {
        self.state = None;
        self.join();
        loop {
            if let Some(state @ (JoinState::Open | JoinState::Error(_))) = self.state {
                return Some(state);
            }
            tokio::select! {
                event = events.recv() => self.handle_event(event?, clock_now()),
                () = sleep_until_opt(self.next_deadline()) => {
                    self.poll_retry(clock_now());
                }
            }
        }
    }

    /// Drive the master until the transport's event stream ends.
    ///
    /// Transport events, registration retries and frame ticks are handled
    /// one at a time on the calling task. Late frames are skipped, not
    /// replayed.
    #[allow(clippy::future_not_send)]
    pub async fn run(&mut self, mut events: EventReceiver, frame_interval: Duration) {
        let mut frames = time::interval(frame_interval.max(Duration::from_millis(1)));
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_frame: Option<f64> = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, clock_now()),
                    None => {
                        info!("transport event stream ended");
                        break;
                    }
                },
                () = sleep_until_opt(self.next_deadline()) => {
                    self.poll_retry(clock_now());
                }
                tick = frames.tick() => {
                    let t = self.elapsed(tick.into_std());
                    let dt = last_frame.map_or(0.0, |prev| t - prev);
                    last_frame = Some(t);
                    self.animate(t, dt);
                }
            }
        }
    }
}

impl<T, P, F> fmt::Debug for DomeInteraction<T, P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomeInteraction")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::gesture::{PointerEvent, TouchState};
    use crate::memory::MemoryNetwork;
    use crate::transport::Opened;
    use dome_proto::{encode_event, ParticipantEvent, PeerErrorKind};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Seen {
        taps: u32,
        ticks: u32,
        gone: bool,
    }

    struct Counter(Rc<RefCell<Seen>>);

    impl Participant for Counter {
        fn button_up(&mut self, event: &PointerEvent) {
            if event.touch_state == Some(TouchState::Tap) {
                self.0.borrow_mut().taps += 1;
            }
        }
        fn animate(&mut self, _t: f64, _dt: f64) {
            self.0.borrow_mut().ticks += 1;
        }
        fn disconnected(&mut self) {
            self.0.borrow_mut().gone = true;
        }
    }

    fn data(peer: &str, event: ParticipantEvent) -> TransportEvent {
        TransportEvent::Data {
            peer: PeerId::from(peer),
            payload: encode_event(&event).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_past_a_taken_room() {
        let net = MemoryNetwork::new();
        assert!(net.reserve(&PeerId::from("demo")));
        let (transport, rx) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::new("demo"),
            |_: &PeerId| Counter(Rc::default()),
        );
        let states = Rc::new(RefCell::new(Vec::new()));
        let sink = states.clone();
        dome.on_state_changed(move |s| sink.borrow_mut().push(s));

        dome.join();
        let _ = time::timeout(Duration::from_millis(100), dome.run(rx, Duration::from_millis(16))).await;

        assert_eq!(dome.comms().local_id(), Some(&PeerId::from("demo1")));
        assert_eq!(dome.url_suffix(), "#1");
        assert_eq!(dome.join_url("http://dome.local/interact/"), "http://dome.local/interact/#1");
        assert_eq!(*states.borrow(), vec![JoinState::Open]);
    }

    #[tokio::test(start_paused = true)]
    async fn join_and_wait_returns_once_registered() {
        let net = MemoryNetwork::new();
        for taken in ["demo", "demo1", "demo2"] {
            assert!(net.reserve(&PeerId::from(taken)));
        }
        let (transport, mut rx) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::new("demo"),
            |_: &PeerId| Counter(Rc::default()),
        );
        let state = dome.join_and_wait(&mut rx).await;
        assert_eq!(state, Some(JoinState::Open));
        assert_eq!(dome.url_suffix(), "#3");
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_participants() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let shared = seen.clone();
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let net = MemoryNetwork::new();
        let (transport, _unused) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::default(),
            move |_: &PeerId| Counter(shared.clone()),
        );
        dome.handle_event(TransportEvent::Open(Opened::Connection(PeerId::from("p"))), clock_now());
        dome.handle_event(data("p", ParticipantEvent::IDLE), clock_now());

        let _ = time::timeout(Duration::from_millis(100), dome.run(rx, Duration::from_millis(10))).await;
        assert!(seen.borrow().ticks >= 5, "ticks = {}", seen.borrow().ticks);
    }

    #[tokio::test]
    async fn run_returns_when_the_stream_closes() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(tx);
        let net = MemoryNetwork::new();
        let (transport, _events) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::default(),
            |_: &PeerId| Counter(Rc::default()),
        );
        dome.run(rx, Duration::from_millis(16)).await;
    }

    #[test]
    fn taps_are_timed_from_the_receive_clock() {
        let seen = Rc::new(RefCell::new(Seen::default()));
        let shared = seen.clone();
        let net = MemoryNetwork::new();
        let (transport, _events) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::default(),
            move |_: &PeerId| Counter(shared.clone()),
        );
        let t0 = Instant::now();
        dome.handle_event(TransportEvent::Open(Opened::Connection(PeerId::from("a"))), t0);
        dome.handle_event(data("a", ParticipantEvent::new([0.0, 0.0, 0.0, 1.0], true)), t0);
        dome.handle_event(
            data("a", ParticipantEvent::new([0.0, 0.0, 0.0, 1.0], false)),
            t0 + Duration::from_millis(50),
        );
        assert_eq!(seen.borrow().taps, 1);

        dome.handle_event(TransportEvent::Close { peer: PeerId::from("a") }, t0);
        assert!(seen.borrow().gone);
        assert!(dome.registry().is_empty());
    }

    #[test]
    fn garbage_payloads_are_dropped() {
        let net = MemoryNetwork::new();
        let (transport, _events) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::default(),
            |_: &PeerId| Counter(Rc::default()),
        );
        let now = Instant::now();
        dome.handle_event(TransportEvent::Open(Opened::Connection(PeerId::from("a"))), now);
        dome.handle_event(
            TransportEvent::Data {
                peer: PeerId::from("a"),
                payload: b"not json".to_vec(),
            },
            now,
        );
        assert!(dome.registry().is_empty());
        assert_eq!(dome.state(), Some(JoinState::Connected));
    }

    #[test]
    fn errors_reach_the_state_hook() {
        let net = MemoryNetwork::new();
        let (transport, _events) = net.endpoint();
        let mut dome = DomeInteraction::new(
            transport,
            &InteractionConfig::default(),
            |_: &PeerId| Counter(Rc::default()),
        );
        dome.handle_event(TransportEvent::Error(PeerErrorKind::Network), Instant::now());
        assert_eq!(dome.state(), Some(JoinState::Error(PeerErrorKind::Network)));
    }
}
