//! # Connection Client Library
//!
//! The client side of the secure UDP connection protocol. A [`network::Client`]
//! is created from a connect token obtained out of band, then driven with
//! [`network::Client::update`] until it reports `Connected` or one of the
//! terminal failure states.
//!
//! ## Handshake
//!
//! The client repeats a connection request carrying the token's sealed
//! private data until the server answers with a challenge, then repeats the
//! challenge response until the first keep-alive arrives. If a server stays
//! silent for the token's timeout, the next address listed in the token is
//! tried. The whole handshake is bounded by the token's lifetime.
//!
//! ## Module Organization
//!
//! ### State Module (`state`)
//! [`state::ClientState`] and its numeric codes; negative codes are errors.
//!
//! ### Network Module (`network`)
//! The state machine, its timers, payload queues and socket ownership.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use client::state::ClientState;
//! use std::time::{Duration, Instant};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let token = std::fs::read("connect.token")?;
//!     let mut client = Client::from_token_bytes(&token)?;
//!     client.connect()?;
//!
//!     let start = Instant::now();
//!     let mut ticker = tokio::time::interval(Duration::from_millis(16));
//!     while !client.state().is_terminal() {
//!         ticker.tick().await;
//!         client.update(start.elapsed().as_secs_f64());
//!
//!         if client.state() == ClientState::Connected {
//!             client.send_data(b"hello")?;
//!         }
//!         while let Some((payload, _)) = client.recv_data() {
//!             println!("received {} bytes", payload.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod state;
