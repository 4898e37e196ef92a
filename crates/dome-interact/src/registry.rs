// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identity → participant ownership.
//!
//! The registry exclusively owns every participant and its gesture tracker.
//! A participant is created on the first event from an identity with an open
//! connection and removed when that connection closes; at most one exists per
//! identity at any time. Data for an identity without an open connection is
//! dropped, so a closed identity stays gone until it connects again. Only
//! open identities are remembered.

use std::collections::{HashMap, HashSet};

use dome_proto::{ParticipantEvent, PeerId};
use glam::DQuat;
use tracing::{debug, trace};

use crate::gesture::{GestureTracker, PointerEvent, TouchEdge};

/// Scene hooks for one remote participant. All methods default to no-ops.
pub trait Participant {
    /// Touch began.
    fn button_down(&mut self, _event: &PointerEvent) {}
    /// Touch ended; `touch_state` is `Some(Tap)` for a quick release.
    fn button_up(&mut self, _event: &PointerEvent) {}
    /// Every received event, after any button hook.
    fn pointer_moved(&mut self, _event: &PointerEvent) {}
    /// Per-frame tick.
    fn animate(&mut self, _t: f64, _dt: f64) {}
    /// The connection closed; the participant is dropped right after.
    fn disconnected(&mut self) {}
}

struct Slot<P> {
    tracker: GestureTracker,
    participant: P,
}

/// Owns the participants of a master display.
pub struct ParticipantRegistry<P, F> {
    factory: F,
    inclination: DQuat,
    order: Vec<PeerId>,
    slots: HashMap<PeerId, Slot<P>>,
    open: HashSet<PeerId>,
}

impl<P, F> ParticipantRegistry<P, F>
where
    P: Participant,
    F: FnMut(&PeerId) -> P,
{
    /// Empty registry building participants with `factory`.
    pub fn new(factory: F, inclination: DQuat) -> Self {
        Self {
            factory,
            inclination,
            order: Vec::new(),
            slots: HashMap::new(),
            open: HashSet::new(),
        }
    }

    fn slot(&mut self, peer: &PeerId) -> &mut Slot<P> {
        let Self {
            factory,
            inclination,
            order,
            slots,
            ..
        } = self;
        slots.entry(peer.clone()).or_insert_with(|| {
            debug!(%peer, "new participant");
            order.push(peer.clone());
            Slot {
                tracker: GestureTracker::new(*inclination),
                participant: factory(peer),
            }
        })
    }

    /// Participant for `peer`, created if absent. `None` unless `peer` has an
    /// open connection.
    pub fn get_or_create(&mut self, peer: &PeerId) -> Option<&mut P> {
        if !self.open.contains(peer) {
            return None;
        }
        Some(&mut self.slot(peer).participant)
    }

    /// Participant for `peer`, if live.
    pub fn get(&self, peer: &PeerId) -> Option<&P> {
        self.slots.get(peer).map(|s| &s.participant)
    }

    /// Mutable participant for `peer`, if live.
    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut P> {
        self.slots.get_mut(peer).map(|s| &mut s.participant)
    }

    /// Gesture state for `peer`, if live.
    pub fn tracker(&self, peer: &PeerId) -> Option<&GestureTracker> {
        self.slots.get(peer).map(|s| &s.tracker)
    }

    /// Remove `peer` without running its disconnect hook.
    pub fn remove(&mut self, peer: &PeerId) -> Option<P> {
        let slot = self.slots.remove(peer)?;
        self.order.retain(|p| p != peer);
        Some(slot.participant)
    }

    /// A connection with `peer` opened; its data is accepted from now on.
    pub fn on_connection_opened(&mut self, peer: &PeerId) {
        self.open.insert(peer.clone());
    }

    /// Whether `peer` has an open connection.
    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.open.contains(peer)
    }

    /// Number of identities with an open connection.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Route one event to `peer`'s participant.
    ///
    /// Button hooks run before `pointer_moved`. Returns the enriched event,
    /// or `None` when `peer` has no open connection.
    pub fn on_received_data(
        &mut self,
        peer: &PeerId,
        event: &ParticipantEvent,
        t: f64,
    ) -> Option<PointerEvent> {
        if !self.open.contains(peer) {
            trace!(%peer, "dropping event for peer without a connection");
            return None;
        }
        let slot = self.slot(peer);
        let pointer = slot.tracker.process(event, t);
        match pointer.edge {
            Some(TouchEdge::Down) => slot.participant.button_down(&pointer),
            Some(TouchEdge::Up) => slot.participant.button_up(&pointer),
            None => {}
        }
        slot.participant.pointer_moved(&pointer);
        Some(pointer)
    }

    /// Tear down `peer`'s participant. Returns whether one existed.
    pub fn on_connection_closed(&mut self, peer: &PeerId) -> bool {
        self.open.remove(peer);
        match self.remove(peer) {
            Some(mut participant) => {
                debug!(%peer, "participant disconnected");
                participant.disconnected();
                true
            }
            None => false,
        }
    }

    /// Tick every participant in insertion order.
    pub fn animate(&mut self, t: f64, dt: f64) {
        for peer in &self.order {
            if let Some(slot) = self.slots.get_mut(peer) {
                slot.participant.animate(t, dt);
            }
        }
    }

    /// Number of live participants.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no participant is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live identities in insertion order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.order.iter()
    }
}
