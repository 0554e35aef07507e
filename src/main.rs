use anyhow::Context;
use sealdrop::core::connection::webrtc::WebRtcFactory;
use sealdrop::core::engine::{Node, NodeEvent, NodeSetup, SignalLink};
use sealdrop::core::pipeline::chunk::MessageType;
use sealdrop::core::pipeline::splitter::MessageDraft;
use sealdrop::core::security::Identity;
use sealdrop::core::signaling::SignalingClient;
use sealdrop::core::store::{MemoryStore, MessageMeta};
use sealdrop::workers::args::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_tracing(verbose: u8) {
    // webrtc_ice logs every late STUN response; keep it at error.
    let filter = match verbose {
        0 => "warn,sealdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();
    init_tracing(args.verbose);

    let identity_path = match &args.identity {
        Some(path) => path.clone(),
        None => Identity::default_path()?,
    };
    let identity = Identity::load_or_create(&identity_path)
        .with_context(|| format!("loading identity from {}", identity_path.display()))?;
    info!(event = "identity_loaded", public_key = %hex::encode(identity.public_key()), "Identity loaded");

    let url = args
        .signaling
        .clone()
        .context("no signaling url: pass --signaling or set `signaling` in config.toml")?;
    let outgoing = match &args.send {
        Some(path) => Some(load_draft(path).await?),
        None => None,
    };
    let output = match &args.output {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let id = Uuid::new_v4();
    let (client, inbound) = SignalingClient::connect(&url, id).await?;
    let factory = Arc::new(WebRtcFactory::new()?);
    let (node, mut events) = Node::spawn(
        NodeSetup {
            id,
            identity,
            config: args.node.clone(),
            factory,
            store: Arc::new(MemoryStore::new()),
        },
        SignalLink {
            outbound: client.sender(),
            inbound,
        },
    );
    node.join_room(args.room());
    println!("peer id {id}, room {}", args.room());

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            NodeEvent::PeerConnected { peer } => {
                println!("connected: {peer}");
                let Some(draft) = &outgoing else { continue };
                if args.to.is_some_and(|to| to != peer) {
                    continue;
                }
                match node.send_message(draft.clone(), Some(peer)).await {
                    Ok(root) => info!(event = "send_started", peer = %peer, root = %hex::encode(&root[..8]), "Sending"),
                    Err(e) => warn!(event = "send_failed", peer = %peer, error = %e, "Could not send"),
                }
            }
            NodeEvent::DeletePeer { peer } => println!("disconnected: {peer}"),
            NodeEvent::MessageProgress { root, saved, total, .. } => {
                info!(event = "receive_progress", root = %hex::encode(&root[..8]), saved, total, "Receiving");
            }
            NodeEvent::SendProgress { peer, acked, total, .. } => {
                info!(event = "send_progress", peer = %peer, acked, total, "Sending");
            }
            NodeEvent::MessageComplete { peer, meta } => match node.read_message(&meta.root).await {
                Ok(data) => {
                    if let Err(e) = save_message(&output, peer, &meta, &data).await {
                        warn!(event = "save_failed", peer = %peer, error = %e, "Could not save message");
                    }
                }
                Err(e) => warn!(event = "read_failed", peer = %peer, error = %e, "Could not read message"),
            },
            NodeEvent::MessageDelivered { peer, root } => {
                println!("delivered {} to {peer}", hex::encode(&root[..8]));
            }
            NodeEvent::CorruptedTransfer { peer, reason, .. } => {
                println!("transfer from {peer} corrupted: {reason}");
            }
            NodeEvent::MessageCreated { .. } => {}
        }
    }

    // Stop chunk loops still running before the peers go away.
    node.cancel_signal().cancel();
    node.shutdown().await;
    client.close();
    Ok(())
}

async fn load_draft(path: &Path) -> anyhow::Result<MessageDraft> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(MessageDraft::file(name, data))
}

/// Text messages are printed; files land in `dir` under their base name.
async fn save_message(dir: &Path, peer: Uuid, meta: &MessageMeta, data: &[u8]) -> anyhow::Result<()> {
    let sent = chrono::DateTime::from_timestamp_millis(meta.created_at as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    match meta.message_type {
        MessageType::Text => {
            println!("[{sent}] {peer}: {}", String::from_utf8_lossy(data));
        }
        MessageType::File => {
            let name = Path::new(&meta.filename)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(hex::encode(&meta.root[..8])));
            tokio::fs::create_dir_all(dir).await?;
            let target = dir.join(name);
            tokio::fs::write(&target, data)
                .await
                .with_context(|| format!("writing {}", target.display()))?;
            println!("[{sent}] {peer}: saved {} ({} bytes)", target.display(), data.len());
        }
    }
    Ok(())
}
