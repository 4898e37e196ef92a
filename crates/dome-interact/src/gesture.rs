// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-participant gesture state: touch debounce and pointing direction.
//!
//! Rules, for an event at time `t` (seconds):
//! - touching after not touching: button down, debounce starts at `t`;
//! - touching for more than [`DEBOUNCE_WINDOW`]: [`TouchState::Holding`] on
//!   every such frame, with [`PointerEvent::hold_started`] set on the first;
//! - touching inside the window: no touch state;
//! - release less than [`DEBOUNCE_WINDOW`] after the down edge: button up
//!   labelled [`TouchState::Tap`]; any later release is a plain button up.
//!
//! Elapsed times within [`TIME_TOLERANCE`] of the window count as exactly on
//! it, so a frame 0.1 s after the down edge is neither a hold nor a tap
//! wherever the touch started.

use dome_proto::ParticipantEvent;
use glam::{DQuat, DVec3};

/// Seconds separating a tap from a hold.
pub const DEBOUNCE_WINDOW: f64 = 0.1;

/// Seconds of slack when comparing an elapsed time against the window.
pub const TIME_TOLERANCE: f64 = 1e-6;

fn past_window(elapsed: f64) -> bool {
    elapsed > DEBOUNCE_WINDOW + TIME_TOLERANCE
}

fn inside_window(elapsed: f64) -> bool {
    elapsed < DEBOUNCE_WINDOW - TIME_TOLERANCE
}

/// Debounced touch classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    /// Released inside the debounce window.
    Tap,
    /// Touching for longer than the debounce window.
    Holding,
}

impl TouchState {
    /// `"tap"` or `"holding"`.
    pub fn as_str(self) -> &'static str {
        match self {
            TouchState::Tap => "tap",
            TouchState::Holding => "holding",
        }
    }
}

/// Touch transition carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchEdge {
    /// Touch began.
    Down,
    /// Touch ended.
    Up,
}

/// A participant event enriched by the receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    /// Normalized device orientation.
    pub orientation: DQuat,
    /// Raw touch flag.
    pub touching: bool,
    /// Unit pointing direction, inclination applied.
    pub pointing: DVec3,
    /// Debounced classification, `None` while undecided or idle.
    pub touch_state: Option<TouchState>,
    /// Down/up transition, if this frame is one.
    pub edge: Option<TouchEdge>,
    /// First `Holding` frame of the current hold.
    pub hold_started: bool,
    /// Degrees; 0 is straight ahead (-Z), +90 is to the right (+X).
    pub azimuth: f64,
    /// Degrees above the horizon; 90 is the zenith.
    pub elevation: f64,
    /// Receive time in seconds.
    pub at: f64,
}

/// Orientation from `[x, y, z, w]`, normalized. Degenerate input maps to identity.
pub fn orientation_from_array([x, y, z, w]: [f64; 4]) -> DQuat {
    let q = DQuat::from_xyzw(x, y, z, w);
    let len = q.length();
    if len.is_finite() && len > f64::EPSILON {
        q / len
    } else {
        DQuat::IDENTITY
    }
}

/// `(azimuth, elevation)` in degrees for a unit direction.
pub fn polar_degrees(dir: DVec3) -> (f64, f64) {
    let elevation = dir.y.clamp(-1.0, 1.0).asin().to_degrees();
    let azimuth = if dir.x.hypot(dir.z) <= f64::EPSILON {
        0.0
    } else {
        dir.x.atan2(-dir.z).to_degrees()
    };
    (azimuth, elevation)
}

/// Gesture state for one participant.
#[derive(Debug, Clone)]
pub struct GestureTracker {
    last_touch: Option<f64>,
    holding: bool,
    inclination: DQuat,
}

impl GestureTracker {
    /// Idle tracker applying `inclination` to every pointing vector.
    pub fn new(inclination: DQuat) -> Self {
        Self {
            last_touch: None,
            holding: false,
            inclination,
        }
    }

    /// Whether a touch is in progress.
    pub fn is_touching(&self) -> bool {
        self.last_touch.is_some()
    }

    /// Whether the current touch has been classified as a hold.
    pub fn is_holding(&self) -> bool {
        self.holding
    }

    /// Time of the current touch's down edge.
    pub fn last_touch(&self) -> Option<f64> {
        self.last_touch
    }

    /// Apply one event received at `t`.
    pub fn process(&mut self, event: &ParticipantEvent, t: f64) -> PointerEvent {
        let orientation = orientation_from_array(event.orientation);
        let pointing = self.inclination * (orientation * DVec3::Y);
        let (azimuth, elevation) = polar_degrees(pointing);

        let mut touch_state = None;
        let mut edge = None;
        let mut hold_started = false;
        match (event.touching, self.last_touch) {
            (true, None) => {
                self.last_touch = Some(t);
                self.holding = false;
                edge = Some(TouchEdge::Down);
            }
            (true, Some(down)) if past_window(t - down) => {
                touch_state = Some(TouchState::Holding);
                hold_started = !self.holding;
                self.holding = true;
            }
            (true, Some(_)) | (false, None) => {}
            (false, Some(down)) => {
                if inside_window(t - down) {
                    touch_state = Some(TouchState::Tap);
                }
                edge = Some(TouchEdge::Up);
                self.last_touch = None;
                self.holding = false;
            }
        }

        PointerEvent {
            orientation,
            touching: event.touching,
            pointing,
            touch_state,
            edge,
            hold_started,
            azimuth,
            elevation,
            at: t,
        }
    }
}

impl Default for GestureTracker {
    fn default() -> Self {
        Self::new(DQuat::IDENTITY)
    }
}
