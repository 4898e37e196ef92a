// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Participant payload: `{ "orientation": [x, y, z, w], "touching": bool }`.
//!
//! There is no versioning or negotiation; both ends agree on this shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One sample streamed by a participant device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticipantEvent {
    /// Device orientation as a unit quaternion `[x, y, z, w]`.
    pub orientation: [f64; 4],
    /// Whether the touch surface is pressed.
    pub touching: bool,
}

impl ParticipantEvent {
    /// Identity orientation, not touching.
    pub const IDLE: ParticipantEvent = ParticipantEvent {
        orientation: [0.0, 0.0, 0.0, 1.0],
        touching: false,
    };

    /// Build a sample.
    pub fn new(orientation: [f64; 4], touching: bool) -> Self {
        Self {
            orientation,
            touching,
        }
    }
}

/// Payload decoding failures.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Not valid JSON or wrong shape.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a participant sample as JSON bytes.
pub fn encode_event(event: &ParticipantEvent) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(event)?)
}

/// Decode JSON bytes into a participant sample.
pub fn decode_event(bytes: &[u8]) -> Result<ParticipantEvent, PayloadError> {
    Ok(serde_json::from_slice(bytes)?)
}
