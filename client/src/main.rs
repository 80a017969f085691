use clap::Parser;
use client::network::Client;
use client::state::ClientState;
use log::{info, warn};
use std::time::Instant;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Connect token file written by the token tool
    #[arg(short = 't', long, default_value = "connect.token")]
    token: String,

    /// Tick rate (updates per second)
    #[arg(short = 'r', long, default_value = "60")]
    tick_rate: u32,

    /// Payloads to send per second once connected
    #[arg(short = 'p', long, default_value = "1")]
    payload_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Reading connect token from {}", args.token);
    let token = std::fs::read(&args.token)?;
    let mut client = Client::from_token_bytes(&token)?;
    client.connect()?;

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let payload_interval = 1.0 / args.payload_rate.max(1) as f64;
    let start = Instant::now();
    let mut last_payload = 0.0;
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let time = start.elapsed().as_secs_f64();
                client.update(time);

                let state = client.state();
                if state.is_terminal() {
                    info!("Client stopped: {} ({})", state, state.code());
                    break;
                }

                if state == ClientState::Connected && time - last_payload >= payload_interval {
                    count += 1;
                    let message = format!("ping {}", count);
                    if let Err(e) = client.send_data(message.as_bytes()) {
                        warn!("Failed to send payload: {}", e);
                    }
                    last_payload = time;
                }

                while let Some((payload, sequence)) = client.recv_data() {
                    info!(
                        "Received {} bytes (sequence {}): {}",
                        payload.len(),
                        sequence,
                        String::from_utf8_lossy(&payload)
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                break;
            }
        }
    }

    client.close();
    Ok(())
}
