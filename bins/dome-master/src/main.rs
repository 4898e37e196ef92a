// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Headless dome master.
//!
//! Registers the room on the broker (probing `#N` suffixes if another master
//! holds the name), prints the join URL phones should open, and logs every
//! participant's taps, holds and pointing direction.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dome_app_core::prefs::DomePrefs;
use dome_broker_client::BrokerTransport;
use dome_config_fs::load_dome_prefs;
use dome_interact::{
    DomeInteraction, InteractionConfig, JoinState, Participant, PeerId, PointerEvent, TouchState,
};
use tracing::{debug, info, trace, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless dome master display")]
struct Args {
    /// Broker address (e.g. 127.0.0.1:9000)
    #[arg(long)]
    broker: Option<SocketAddr>,
    /// API key presented to the broker
    #[arg(long)]
    api_key: Option<String>,
    /// Room id prefix
    #[arg(long)]
    prefix: Option<String>,
    /// Dome tilt around the X axis, in degrees
    #[arg(long)]
    inclination_deg: Option<f64>,
    /// Participant tick rate in Hz
    #[arg(long)]
    frame_rate: Option<f64>,
    /// Base URL phones open; the instance suffix is appended
    #[arg(long)]
    join_url: Option<String>,
}

struct Settings {
    broker: SocketAddr,
    api_key: String,
    config: InteractionConfig,
    frame_interval: Duration,
    join_url: String,
}

fn settings(args: Args, prefs: DomePrefs) -> Result<Settings> {
    let ip = prefs.interaction;
    let broker = match args.broker {
        Some(addr) => addr,
        None => ip
            .broker_addr
            .parse()
            .with_context(|| format!("invalid broker address {:?}", ip.broker_addr))?,
    };
    let rate = args.frame_rate.unwrap_or(ip.frame_rate_hz);
    if !(rate.is_finite() && rate > 0.0) {
        bail!("frame rate must be positive, got {rate}");
    }
    let inclination = args
        .inclination_deg
        .map_or_else(|| ip.inclination_radians(), f64::to_radians);
    Ok(Settings {
        broker,
        api_key: args.api_key.unwrap_or(ip.api_key),
        config: InteractionConfig::new(args.prefix.unwrap_or(ip.peer_prefix))
            .with_inclination(inclination),
        frame_interval: Duration::from_secs_f64(1.0 / rate),
        join_url: args.join_url.unwrap_or(ip.join_url),
    })
}

/// Logs one phone's gestures.
struct Cursor {
    peer: PeerId,
    holding: bool,
}

impl Cursor {
    fn new(peer: &PeerId) -> Self {
        info!(%peer, "participant joined");
        Self {
            peer: peer.clone(),
            holding: false,
        }
    }
}

impl Participant for Cursor {
    fn button_down(&mut self, event: &PointerEvent) {
        debug!(peer = %self.peer, azimuth = event.azimuth, elevation = event.elevation, "button down");
    }

    fn button_up(&mut self, event: &PointerEvent) {
        let gesture = match event.touch_state {
            Some(TouchState::Tap) => "tap",
            _ if self.holding => "hold released",
            _ => "release",
        };
        self.holding = false;
        info!(
            peer = %self.peer,
            azimuth = event.azimuth,
            elevation = event.elevation,
            gesture
        );
    }

    fn pointer_moved(&mut self, event: &PointerEvent) {
        if event.hold_started {
            self.holding = true;
            info!(peer = %self.peer, azimuth = event.azimuth, elevation = event.elevation, "hold");
        }
        trace!(peer = %self.peer, x = event.pointing.x, y = event.pointing.y, z = event.pointing.z, "pointer");
    }

    fn disconnected(&mut self) {
        info!(peer = %self.peer, "participant left");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    let args = Args::parse();
    let prefs = load_dome_prefs().unwrap_or_else(|err| {
        warn!(?err, "could not load prefs; using defaults");
        DomePrefs::default()
    });
    let settings = settings(args, prefs)?;

    let (transport, mut events) = BrokerTransport::connect(settings.broker, settings.api_key).await?;
    let mut dome = DomeInteraction::new(transport, &settings.config, Cursor::new);
    dome.on_state_changed(|state| match state {
        JoinState::Error(kind) => warn!(%kind, "join state error"),
        other => debug!(state = %other, "join state"),
    });

    match dome.join_and_wait(&mut events).await {
        Some(JoinState::Open) => {}
        Some(state) => bail!("could not register room: {state}"),
        None => bail!("broker closed the connection during registration"),
    }
    info!(url = %dome.join_url(&settings.join_url), "room open; phones can join");

    tokio::select! {
        () = dome.run(events, settings.frame_interval) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("shutting down");
        }
    }
    Ok(())
}
