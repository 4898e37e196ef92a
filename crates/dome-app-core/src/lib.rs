// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for dome interaction tools (config, prefs).
//! Keeps binaries thin and independent of where settings are stored.

pub mod config;
pub mod prefs;
