//! Folio relay: standalone signaling and forwarding server.
//!
//! Replicas configured with a relay transport join a room here; the relay
//! introduces them to each other and forwards their frames. It keeps no
//! document state.
//!
//! Usage:
//!   cargo run -p folio-relay
//!   cargo run -p folio-relay -- --bind 0.0.0.0:9090 --max-peers-per-room 32
//!
//! Logging follows `RUST_LOG` (default `info`).

use clap::Parser;
use log::info;

use folio_collab::relay::{RelayConfig, RelayServer};

/// WebSocket relay for Folio replicas.
#[derive(Parser, Debug)]
#[command(name = "folio-relay")]
#[command(about = "Signaling and forwarding relay for Folio replicas")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum members per room
    #[arg(long, default_value_t = 100)]
    max_peers_per_room: usize,

    /// Per-room broadcast buffer, in messages
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        RelayConfig {
            bind_addr: args.bind,
            max_peers_per_room: args.max_peers_per_room,
            broadcast_capacity: args.broadcast_capacity.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = RelayServer::new(RelayConfig::from(args));
    info!("Starting Folio relay on {}", server.bind_addr());

    server.run().await
}
