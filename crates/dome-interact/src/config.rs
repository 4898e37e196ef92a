// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runtime configuration passed to the master and the remote at startup.

use glam::DQuat;

/// Explicit settings for one interaction session.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionConfig {
    /// Prefix of the master's room id; the instance suffix is appended.
    pub peer_prefix: String,
    /// Dome tilt around the X axis, in radians, applied to every pointing vector.
    pub inclination: f64,
}

impl InteractionConfig {
    /// Settings with the given room prefix and no tilt.
    pub fn new(peer_prefix: impl Into<String>) -> Self {
        Self {
            peer_prefix: peer_prefix.into(),
            inclination: 0.0,
        }
    }

    /// Builder-style tilt override (radians).
    pub fn with_inclination(mut self, radians: f64) -> Self {
        self.inclination = radians;
        self
    }

    /// Tilt as a rotation.
    pub fn inclination_quat(&self) -> DQuat {
        DQuat::from_rotation_x(self.inclination)
    }
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self::new("domeInteraction")
    }
}
