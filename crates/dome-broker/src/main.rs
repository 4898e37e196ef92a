// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rendezvous/relay broker for dome interaction peers (CBOR frames over TCP).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dome_app_core::prefs::DomePrefs;
use dome_config_fs::load_dome_prefs;
use dome_proto::wire::{FrameReader, MAX_PAYLOAD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod hub;

use hub::{handle_message, Hub, HubState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dome interaction rendezvous broker")]
struct Args {
    /// TCP listener for peers (overrides the saved preference)
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// API key peers must present when registering (overrides the saved preference)
    #[arg(long)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    let args = Args::parse();

    // Config (best-effort)
    let prefs = load_dome_prefs().unwrap_or_else(|err| {
        warn!(?err, "could not load prefs; using defaults");
        DomePrefs::default()
    });

    let listen = match args.listen {
        Some(addr) => addr,
        None => prefs
            .broker
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", prefs.broker.listen))?,
    };
    let api_key = args.api_key.unwrap_or(prefs.interaction.api_key);

    let hub: Hub = Arc::new(Mutex::new(HubState::new(api_key)));
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    info!(%listen, "broker listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub).await {
                warn!(?err, %peer_addr, "client handler error");
            }
        });
    }
}

async fn handle_client(stream: TcpStream, hub: Hub) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    let conn_id = hub.lock().await.add_conn(tx);

    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let result = pump_frames(&mut reader, conn_id, &hub).await;
    hub.lock().await.remove_conn(conn_id)?;
    result
}

async fn pump_frames(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    conn_id: u64,
    hub: &Hub,
) -> Result<()> {
    let mut frames = FrameReader::new();
    let mut read_buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        frames.push(&read_buf[..n]);
        loop {
            match frames.next_message() {
                Ok(Some(msg)) => handle_message(msg, conn_id, hub).await?,
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, conn_id, max = MAX_PAYLOAD, "dropping connection after bad frame");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use dome_proto::wire::{decode_message, encode_message};
    use dome_proto::{BrokerMessage, PeerId};
    use tokio::time::{timeout, Duration};

    async fn recv(stream: &mut TcpStream, frames: &mut FrameReader) -> BrokerMessage {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(msg) = frames.next_message().unwrap() {
                return msg;
            }
            let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
                .await
                .expect("broker reply")
                .unwrap();
            assert!(n > 0, "broker hung up");
            frames.push(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn disconnect_releases_the_name_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub: Hub = Arc::new(Mutex::new(HubState::new("k")));
        let server_hub = hub.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let hub = server_hub.clone();
                tokio::spawn(async move {
                    let _ = handle_client(stream, hub).await;
                });
            }
        });

        let register = encode_message(&BrokerMessage::Register {
            key: "k".into(),
            id: Some(PeerId::from("demo")),
        })
        .unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut first_frames = FrameReader::new();
        first.write_all(&register).await.unwrap();
        assert_eq!(
            recv(&mut first, &mut first_frames).await,
            BrokerMessage::Registered { id: PeerId::from("demo") }
        );
        drop(first);

        // The hub processes the hangup asynchronously; poll until the name frees up.
        let mut attempt = 0;
        loop {
            let mut second = TcpStream::connect(addr).await.unwrap();
            let mut frames = FrameReader::new();
            second.write_all(&register).await.unwrap();
            match recv(&mut second, &mut frames).await {
                BrokerMessage::Registered { id } => {
                    assert_eq!(id, PeerId::from("demo"));
                    break;
                }
                other => {
                    attempt += 1;
                    assert!(attempt < 50, "name never released: {other:?}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    #[tokio::test]
    async fn garbage_drops_only_that_client() {
        let hub: Hub = Arc::new(Mutex::new(HubState::new("k")));
        let (mut client, server) = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            (client, server)
        };
        let task = tokio::spawn(handle_client(server, hub.clone()));
        client.write_all(b"definitely not a frame").await.unwrap();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("handler exits")
            .unwrap()
            .unwrap();
        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf).await;
        assert!(decode_message(&buf).is_err());
    }
}
