//! docmesh headless peer
//!
//! Joins a room on the local network (mDNS) or through bootstrap nodes
//! (Kademlia), hosts a document store for accepted peers and serves a small
//! HTTP API:
//!
//! - `GET  /api/v1/status`: known peers, broadcast and queue state
//! - `POST /api/v1/events`: enqueue a file event
//! - `POST /api/v1/sync`:   push to every known peer
//!
//! Usage:
//!   docmesh-peer --config peer.json --http-port 4002
//!   docmesh-peer --couchdb-url http://127.0.0.1:5984 --database notes

use anyhow::{Context, Result};
use clap::Parser;
use docmesh_peer::build_router;
use docmesh_storage::{
    DocumentStore, HttpDocumentStore, HttpStoreConfig, KeyValueStore, MemoryDocumentStore,
    SqliteKeyValueStore,
};
use docmesh_sync::p2p::{Keypair, Multiaddr, P2pConfig, P2pMesh};
use docmesh_sync::{ReplicatorSettings, SessionEvent};
use std::{fs, path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docmesh-peer")]
#[command(about = "Headless docmesh peer")]
struct Args {
    /// Replicator settings (JSON). Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device name advertised to peers (overrides the settings file)
    #[arg(short, long)]
    name: Option<String>,

    /// Room to join (overrides the settings file)
    #[arg(short, long)]
    room: Option<String>,

    /// CouchDB-compatible server holding the local database
    #[arg(long)]
    couchdb_url: Option<String>,

    /// Database name on the CouchDB server
    #[arg(long, default_value = "docmesh")]
    database: String,

    /// SQLite file for acceptance decisions and the queue snapshot
    #[arg(long, default_value = "docmesh-peer.db")]
    state: PathBuf,

    /// Path to identity key file
    #[arg(short, long, default_value = "peer-identity.key")]
    identity: PathBuf,

    /// UDP port for QUIC (0 picks one)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Bootstrap node multiaddrs
    #[arg(long)]
    bootstrap: Vec<String>,

    /// HTTP API port
    #[arg(long, default_value = "4002")]
    http_port: u16,

    /// Broadcast local changes to accepted peers
    #[arg(long)]
    broadcast: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .compact()
        .init();

    let mut settings = match &args.config {
        Some(path) => ReplicatorSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ReplicatorSettings::default(),
    };
    if let Some(name) = args.name.clone() {
        settings.device_name = name;
    }
    if let Some(room) = args.room.clone() {
        settings.room = room;
    }
    if args.broadcast {
        settings.auto_broadcast = true;
    }

    let store: Arc<dyn DocumentStore> = match &args.couchdb_url {
        Some(url) => Arc::new(
            HttpDocumentStore::new(HttpStoreConfig {
                base_url: url.clone(),
                database: args.database.clone(),
                ..Default::default()
            })
            .context("Failed to create CouchDB client")?,
        ),
        None => {
            warn!("No --couchdb-url given, documents live in memory only");
            Arc::new(MemoryDocumentStore::new(args.database.clone()))
        }
    };
    let kv: Arc<dyn KeyValueStore> = Arc::new(
        SqliteKeyValueStore::open(&args.state)
            .with_context(|| format!("Failed to open state at {}", args.state.display()))?,
    );

    let keypair = load_or_generate_keypair(&args.identity)?;
    let mut bootstrap_nodes = Vec::new();
    for addr in &args.bootstrap {
        let addr: Multiaddr = addr
            .parse()
            .with_context(|| format!("Invalid bootstrap address {addr}"))?;
        bootstrap_nodes.push(addr);
    }
    let mesh = P2pMesh::with_keypair(
        keypair,
        P2pConfig {
            room: settings.room.clone(),
            listen_addrs: vec![
                format!("/ip4/0.0.0.0/udp/{}/quic-v1", args.port).parse()?,
                format!("/ip6/::/udp/{}/quic-v1", args.port).parse()?,
            ],
            bootstrap_nodes,
            ..Default::default()
        },
    );
    let libp2p_peer_id = mesh.libp2p_peer_id();

    let name = settings.device_name.clone();
    let room = settings.room.clone();
    let node = docmesh_peer::assemble(settings, Arc::new(mesh), store, kv);
    let restored = node.queue.restore().context("Failed to restore file event queue")?;
    node.session
        .start()
        .await
        .context("Failed to join the room")?;

    let mut events = node.session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ReplicationFailed {
                    peer,
                    direction,
                    message,
                } => warn!("Replication {direction:?} {peer} failed: {message}"),
                SessionEvent::TweakMismatch {
                    peer, differences, ..
                } => warn!("Peer {peer} settings differ: {}", differences.join(", ")),
                other => info!("{other:?}"),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", args.http_port))?;
    info!("HTTP API listening on port {}", args.http_port);

    println!("\n========================================");
    println!("  docmesh peer running");
    println!("========================================");
    println!("  Name:      {name}");
    println!("  Room:      {room}");
    println!("  PeerId:    {libp2p_peer_id}");
    println!("  HTTP Port: {}", args.http_port);
    println!("  Restored:  {restored} file events");
    println!("========================================\n");

    let app = build_router(node.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    node.queue.shutdown();
    node.session.stop().await?;
    Ok(())
}

fn load_or_generate_keypair(path: &PathBuf) -> Result<Keypair> {
    if path.exists() {
        info!("Loading identity from {:?}", path);
        let bytes = fs::read(path).context("Failed to read identity file")?;
        Keypair::from_protobuf_encoding(&bytes).context("Failed to decode identity key")
    } else {
        info!("Generating new identity at {:?}", path);
        let keypair = Keypair::generate_ed25519();
        fs::write(path, keypair.to_protobuf_encoding()?)
            .context("Failed to write identity file")?;
        Ok(keypair)
    }
}
