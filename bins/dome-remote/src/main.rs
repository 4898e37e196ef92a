// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Participant simulator.
//!
//! Stands in for a phone: dials the master named by the join URL and streams
//! a slowly sweeping orientation with a short tap (or a hold) every few
//! seconds.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dome_app_core::prefs::DomePrefs;
use dome_broker_client::BrokerTransport;
use dome_config_fs::load_dome_prefs;
use dome_interact::comms::instance_from_url;
use dome_interact::{InteractionConfig, JoinState, ParticipantEvent, RemoteControl};
use glam::DQuat;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated dome participant")]
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
    /// Join URL as shown by the master; its `#N` fragment selects the instance
    #[arg(long)]
    url: Option<String>,
    /// Samples per second
    #[arg(long)]
    rate: Option<f64>,
    /// Seconds between touches
    #[arg(long, default_value_t = 2.0)]
    touch_every: f64,
    /// Hold each touch for half a second instead of tapping
    #[arg(long)]
    hold: bool,
    /// Sweep speed in degrees per second
    #[arg(long, default_value_t = 30.0)]
    sweep_deg: f64,
}

/// How the simulated phone moves.
#[derive(Debug, Clone, Copy)]
struct Motion {
    touch_every: f64,
    touch_for: f64,
    sweep_rad: f64,
}

impl Motion {
    // Phone tipped forward so the reference axis points at the horizon, then
    // swung left/right.
    fn sample(self, t: f64, sample: &mut ParticipantEvent) {
        let yaw = (t * self.sweep_rad).sin() * std::f64::consts::FRAC_PI_3;
        let q = DQuat::from_rotation_y(yaw) * DQuat::from_rotation_x(-std::f64::consts::FRAC_PI_2);
        sample.orientation = q.to_array();
        sample.touching = self.touch_every > 0.0 && t.rem_euclid(self.touch_every) < self.touch_for;
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

    let ip = prefs.interaction;
    let broker = match args.broker {
        Some(addr) => addr,
        None => ip
            .broker_addr
            .parse()
            .with_context(|| format!("invalid broker address {:?}", ip.broker_addr))?,
    };
    let rate = args.rate.unwrap_or(prefs.remote.send_rate_hz);
    if !(rate.is_finite() && rate > 0.0) {
        bail!("send rate must be positive, got {rate}");
    }
    let url = args.url.unwrap_or(ip.join_url);
    let config = InteractionConfig::new(args.prefix.unwrap_or(ip.peer_prefix));
    let motion = Motion {
        touch_every: args.touch_every,
        touch_for: if args.hold { 0.5 } else { 0.05 },
        sweep_rad: args.sweep_deg.to_radians(),
    };

    let (transport, events) = BrokerTransport::connect(broker, ip.api_key).await?;
    let mut remote = RemoteControl::new(transport, &config);
    info!(%url, instance = ?instance_from_url(&url), "joining");
    remote.join_url(&url);

    let interval = Duration::from_secs_f64(1.0 / rate);
    let outcome = tokio::select! {
        res = remote.run(events, interval, |t, sample| motion.sample(t, sample)) => res?,
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("shutting down");
            return Ok(());
        }
    };
    match outcome {
        Some(JoinState::Error(kind)) => bail!("could not reach the master: {kind}"),
        _ => {
            info!("connection ended");
            Ok(())
        }
    }
}
