// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! End-to-end: a master and several phones over the in-process network.
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use dome_interact::{
    DomeInteraction, EventReceiver, InteractionConfig, JoinState, MemoryNetwork, Participant,
    PeerId, PointerEvent, RemoteControl, TouchState, Transport, JOIN_RETRY_DELAY,
};

type Journal = Rc<RefCell<Vec<String>>>;

struct Cursor {
    id: PeerId,
    journal: Journal,
}

impl Cursor {
    fn note(&self, what: &str) {
        self.journal.borrow_mut().push(format!("{}:{what}", self.id));
    }
}

impl Participant for Cursor {
    fn button_down(&mut self, _event: &PointerEvent) {
        self.note("down");
    }
    fn button_up(&mut self, event: &PointerEvent) {
        match event.touch_state {
            Some(TouchState::Tap) => self.note("tap"),
            _ => self.note("up"),
        }
    }
    fn pointer_moved(&mut self, event: &PointerEvent) {
        if event.hold_started {
            self.note("hold");
        }
    }
    fn disconnected(&mut self) {
        self.note("gone");
    }
}

fn deliver<T: Transport>(remote: &mut RemoteControl<T>, rx: &mut EventReceiver, now: Instant) {
    while let Ok(event) = rx.try_recv() {
        remote.handle_event(event, now);
    }
}

struct Master<T, F> {
    dome: DomeInteraction<T, Cursor, F>,
    rx: EventReceiver,
}

impl<T: Transport, F: FnMut(&PeerId) -> Cursor> Master<T, F> {
    fn deliver(&mut self, now: Instant) {
        while let Ok(event) = self.rx.try_recv() {
            self.dome.handle_event(event, now);
        }
    }
}

fn master(
    net: &MemoryNetwork,
    journal: &Journal,
) -> Master<dome_interact::MemoryTransport, impl FnMut(&PeerId) -> Cursor> {
    let (transport, rx) = net.endpoint();
    let journal = journal.clone();
    let dome = DomeInteraction::new(
        transport,
        &InteractionConfig::new("domeInteraction"),
        move |id: &PeerId| Cursor {
            id: id.clone(),
            journal: journal.clone(),
        },
    );
    Master { dome, rx }
}

#[test]
fn second_master_takes_suffix_one_and_phones_follow_the_url() {
    let net = MemoryNetwork::new();
    let journal = Journal::default();
    let t0 = Instant::now();

    let mut first = master(&net, &journal);
    first.dome.join();
    first.deliver(t0);
    assert_eq!(first.dome.url_suffix(), "");

    let mut second = master(&net, &journal);
    second.dome.join();
    second.deliver(t0);
    assert_eq!(second.dome.state(), None);
    let retry_at = second.dome.next_deadline().unwrap();
    assert_eq!(retry_at, t0 + JOIN_RETRY_DELAY);
    assert!(second.dome.poll_retry(retry_at));
    second.deliver(retry_at);
    assert_eq!(second.dome.state(), Some(JoinState::Open));
    let url = second.dome.join_url("http://dome.local/interact/");
    assert_eq!(url, "http://dome.local/interact/#1");

    let (phone, mut phone_rx) = net.endpoint();
    let mut phone = RemoteControl::new(phone, &InteractionConfig::new("domeInteraction"));
    phone.join_url(&url);
    deliver(&mut phone, &mut phone_rx, retry_at);
    assert!(phone.is_connected());
    assert_eq!(
        phone.comms().connections().next(),
        Some(&PeerId::from("domeInteraction1"))
    );

    phone.send_frame().unwrap();
    second.deliver(retry_at);
    first.deliver(retry_at);
    assert_eq!(second.dome.registry().len(), 1);
    assert!(first.dome.registry().is_empty());
}

#[test]
fn taps_holds_and_departures_reach_the_scene() {
    let net = MemoryNetwork::new();
    let journal = Journal::default();
    let t0 = Instant::now();
    let ms = |n: u64| t0 + Duration::from_millis(n);

    let mut m = master(&net, &journal);
    m.dome.join();
    m.deliver(t0);

    let (a, mut a_rx) = net.endpoint();
    let mut a = RemoteControl::new(a, &InteractionConfig::default());
    a.join(None);
    deliver(&mut a, &mut a_rx, t0);
    let a_id = a.comms().local_id().cloned().unwrap();

    let (b, mut b_rx) = net.endpoint();
    let mut b = RemoteControl::new(b, &InteractionConfig::default());
    b.join(None);
    deliver(&mut b, &mut b_rx, t0);
    let b_id = b.comms().local_id().cloned().unwrap();
    m.deliver(t0);
    assert_eq!(m.dome.comms().connections().count(), 2);

    a.set_touching(true);
    a.send_frame().unwrap();
    b.set_touching(true);
    b.send_frame().unwrap();
    m.deliver(ms(0));

    a.set_touching(false);
    a.send_frame().unwrap();
    m.deliver(ms(50));

    b.send_frame().unwrap();
    m.deliver(ms(200));
    b.send_frame().unwrap();
    m.deliver(ms(300));

    drop(b);
    m.deliver(ms(310));

    let mut peers: Vec<_> = m.dome.registry().peers().cloned().collect();
    peers.sort();
    assert_eq!(peers, vec![a_id.clone()]);

    let a_log: Vec<_> = journal
        .borrow()
        .iter()
        .filter_map(|e| e.strip_prefix(&format!("{a_id}:")).map(str::to_owned))
        .collect();
    let b_log: Vec<_> = journal
        .borrow()
        .iter()
        .filter_map(|e| e.strip_prefix(&format!("{b_id}:")).map(str::to_owned))
        .collect();
    assert_eq!(a_log, ["down", "tap"]);
    assert_eq!(b_log, ["down", "hold", "gone"]);
}
