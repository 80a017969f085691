//! Development tool that mints a connect token for a local server.

use clap::Parser;
use log::info;
use server::args::{parse_key, parse_protocol_id};
use shared::{Key, TokenGenerator, TIMEOUT_SECONDS};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mint a connect token", long_about = None)]
struct Args {
    /// Hex-encoded 32-byte private key the server was started with
    #[arg(short = 'k', long, value_parser = parse_key)]
    private_key: Key,

    /// Server addresses the token is valid for, tried in order
    #[arg(short, long = "server", default_value = "127.0.0.1:40000")]
    servers: Vec<SocketAddr>,

    /// Protocol id shared with the server
    #[arg(long, default_value = "0x1122334455667788", value_parser = parse_protocol_id)]
    protocol_id: u64,

    /// Client id; random when omitted
    #[arg(short, long)]
    client_id: Option<u64>,

    /// Seconds until the token expires
    #[arg(short, long, default_value = "30")]
    expire: u64,

    /// Session timeout in seconds
    #[arg(short, long, default_value_t = TIMEOUT_SECONDS)]
    timeout: i32,

    /// File the token blob is written to
    #[arg(short, long, default_value = "connect.token")]
    output: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let client_id = args.client_id.unwrap_or_else(rand::random);

    let token = TokenGenerator::new(args.protocol_id, args.private_key)
        .with_expire_seconds(args.expire)
        .with_timeout_seconds(args.timeout)
        .generate(client_id, args.servers.clone(), Vec::new())?;

    std::fs::write(&args.output, token.write()?)?;
    info!(
        "Wrote token for client {} valid for {:?} to {}",
        client_id, args.servers, args.output
    );
    println!("{}", args.output);
    Ok(())
}
