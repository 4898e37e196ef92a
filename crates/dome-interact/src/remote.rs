// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Participant side: dial the master and stream orientation/touch samples.

use std::time::{Duration, Instant};

use dome_proto::{encode_event, ParticipantEvent, PayloadError, PeerId};
use glam::DQuat;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, trace};

use crate::comms::{instance_from_url, CommsListener, JoinState, PeerCommunications, Role};
use crate::config::InteractionConfig;
use crate::interaction::clock_now;
use crate::transport::{EventReceiver, Transport, TransportEvent};

struct StateSink<'a>(&'a mut Option<JoinState>);

impl CommsListener for StateSink<'_> {
    fn state_changed(&mut self, state: JoinState) {
        info!(%state, "remote join state");
        *self.0 = Some(state);
    }

    fn received_data(&mut self, payload: &[u8], peer: &PeerId, _at: Instant) {
        trace!(%peer, len = payload.len(), "ignoring data sent to a participant");
    }
}

/// One phone-like participant.
pub struct RemoteControl<T> {
    comms: PeerCommunications<T>,
    current: ParticipantEvent,
    state: Option<JoinState>,
}

impl<T: Transport> RemoteControl<T> {
    /// Idle participant over `transport`.
    pub fn new(transport: T, config: &InteractionConfig) -> Self {
        Self {
            comms: PeerCommunications::new(transport, config.peer_prefix.clone()),
            current: ParticipantEvent::IDLE,
            state: None,
        }
    }

    /// Register anonymously and dial `prefix + instance` once.
    pub fn join(&mut self, instance: Option<u32>) {
        self.comms
            .join(Role::Participant, instance, &mut StateSink(&mut self.state));
    }

    /// Join the instance named by a join URL's `#N` fragment.
    pub fn join_url(&mut self, url: &str) {
        self.join(instance_from_url(url));
    }

    /// Feed one transport event observed at `now`.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        self.comms
            .handle_event(event, now, &mut StateSink(&mut self.state));
    }

    /// Orientation for subsequent frames.
    pub fn set_orientation(&mut self, orientation: DQuat) {
        self.current.orientation = orientation.to_array();
    }

    /// Touch flag for subsequent frames.
    pub fn set_touching(&mut self, touching: bool) {
        self.current.touching = touching;
    }

    /// Sample sent by the next frame.
    pub fn current(&self) -> ParticipantEvent {
        self.current
    }

    /// Latest join state.
    pub fn state(&self) -> Option<JoinState> {
        self.state
    }

    /// Whether the master connection is open.
    pub fn is_connected(&self) -> bool {
        self.comms.connections().next().is_some()
    }

    /// Peer mesh.
    pub fn comms(&self) -> &PeerCommunications<T> {
        &self.comms
    }

    /// Send the current sample to every open connection.
    pub fn send_frame(&mut self) -> Result<(), PayloadError> {
        let payload = encode_event(&self.current)?;
        self.comms.send_to_all(&payload);
        Ok(())
    }

    /// Stream samples until the join fails, the master connection closes, or
    /// the event stream ends. Participants never redial.
    ///
    /// `drive` updates the sample once per frame, given seconds since start.
    /// Returns the last join state.
    pub async fn run<D>(
        &mut self,
        mut events: EventReceiver,
        send_interval: Duration,
        mut drive: D,
    ) -> Result<Option<JoinState>, PayloadError>
    where
        D: FnMut(f64, &mut ParticipantEvent),
    {
        let start = clock_now();
        let mut frames = time::interval(send_interval.max(Duration::from_millis(1)));
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let was_connected = self.is_connected();
                        self.handle_event(event, clock_now());
                        if let Some(JoinState::Error(_)) = self.state {
                            break;
                        }
                        if was_connected && !self.is_connected() {
                            info!("master connection closed");
                            break;
                        }
                    }
                    None => break,
                },
                tick = frames.tick() => {
                    let t = tick
                        .into_std()
                        .saturating_duration_since(start)
                        .as_secs_f64();
                    drive(t, &mut self.current);
                    if self.is_connected() {
                        self.send_frame()?;
                    }
                }
            }
        }
        Ok(self.state)
    }
}
