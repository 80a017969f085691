use clap::Parser;
use log::{info, warn};
use server::args::{parse_key, parse_protocol_id};
use server::network::{Server, ServerConfig};
use shared::{crypto, Key, TIMEOUT_SECONDS};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "40000")]
    port: u16,

    /// Address clients use to reach this server; defaults to the bind address
    #[arg(long)]
    public_address: Option<SocketAddr>,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Protocol id shared with the token backend
    #[arg(long, default_value = "0x1122334455667788", value_parser = parse_protocol_id)]
    protocol_id: u64,

    /// Hex-encoded 32-byte private key shared with the token backend
    #[arg(short = 'k', long, value_parser = parse_key)]
    private_key: Option<Key>,

    /// Session timeout in seconds for tokens that carry none
    #[arg(long, default_value_t = TIMEOUT_SECONDS)]
    timeout: i32,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let private_key = match args.private_key {
        Some(key) => key,
        None => {
            let key = crypto::generate_key();
            warn!("No private key given, generated {}", hex::encode(key));
            key
        }
    };

    let mut config = ServerConfig::new(
        args.protocol_id,
        private_key,
        args.public_address.unwrap_or(bind_addr),
    );
    config.max_clients = args.max_clients;
    config.timeout_seconds = args.timeout;

    let mut server = Server::new(config)?;
    server.listen(bind_addr)?;

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let start = Instant::now();
    let mut last_count = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                server.update(start.elapsed().as_secs_f64());

                // Echo payloads back to their sender.
                for index in 0..server.max_clients() {
                    while let Some((payload, _)) = server.recv_payload(index) {
                        if let Err(e) = server.send_payload(index, &payload) {
                            warn!("Failed to echo payload to slot {}: {}", index, e);
                        }
                    }
                }

                let count = server.connected_client_count();
                if count != last_count {
                    info!("{} client(s) connected", count);
                    last_count = count;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.close();
    Ok(())
}
