// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted preferences shared by the broker, the master display and the
//! participant remote.

use serde::{Deserialize, Serialize};

/// Config key under which [`DomePrefs`] is stored.
pub const PREFS_KEY: &str = "dome_interaction";

/// Saved preferences for one dome installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DomePrefs {
    /// Room naming, keys and dome orientation.
    pub interaction: InteractionPrefs,
    /// Broker listener settings.
    pub broker: BrokerPrefs,
    /// Participant remote settings.
    pub remote: RemotePrefs,
}

/// Settings every endpoint of an installation must agree on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionPrefs {
    /// Prefix of the master's room id.
    pub peer_prefix: String,
    /// Key presented to the broker on registration.
    pub api_key: String,
    /// Broker address dialed by master and participants.
    pub broker_addr: String,
    /// Page participants open; the instance suffix is appended to it.
    pub join_url: String,
    /// Tilt of the dome around the X axis, in degrees.
    pub inclination_deg: f64,
    /// Master animation rate.
    pub frame_rate_hz: f64,
}

impl InteractionPrefs {
    /// Dome tilt in radians.
    pub fn inclination_radians(&self) -> f64 {
        self.inclination_deg.to_radians()
    }
}

impl Default for InteractionPrefs {
    fn default() -> Self {
        Self {
            peer_prefix: "domeInteraction".into(),
            api_key: "dome-dev-key".into(),
            broker_addr: "127.0.0.1:9000".into(),
            join_url: "http://localhost:8000/interact/".into(),
            inclination_deg: 0.0,
            frame_rate_hz: 60.0,
        }
    }
}

/// Broker listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerPrefs {
    /// TCP listen address.
    pub listen: String,
}

impl Default for BrokerPrefs {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".into(),
        }
    }
}

/// Participant remote settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotePrefs {
    /// Samples sent per second.
    pub send_rate_hz: f64,
}

impl Default for RemotePrefs {
    fn default() -> Self {
        Self { send_rate_hz: 60.0 }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let prefs: DomePrefs =
            serde_json::from_str(r#"{"interaction":{"peer_prefix":"hayden"}}"#).unwrap();
        assert_eq!(prefs.interaction.peer_prefix, "hayden");
        assert_eq!(prefs.interaction.api_key, InteractionPrefs::default().api_key);
        assert_eq!(prefs.broker, BrokerPrefs::default());
    }

    #[test]
    fn inclination_is_converted_to_radians() {
        let prefs = InteractionPrefs {
            inclination_deg: 180.0,
            ..InteractionPrefs::default()
        };
        assert!((prefs.inclination_radians() - std::f64::consts::PI).abs() < 1e-12);
    }
}
