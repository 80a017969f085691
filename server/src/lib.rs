//! # Connection Server Library
//!
//! The authoritative side of the secure UDP connection protocol. A server
//! admits clients that present a valid connect token, keeps a fixed table of
//! client slots, and exchanges encrypted keep-alive and payload frames with
//! each connected client.
//!
//! ## Admission
//!
//! Clients are admitted in two round trips. A connection request carries the
//! sealed private half of a connect token; when it opens, checks out and a
//! slot is free, the server stores the session keys for that address and
//! answers with a challenge. The client echoes the challenge back and only
//! then receives a slot. Requests that fail any check are dropped silently;
//! a full server answers with a connection denied frame.
//!
//! ## Module Organization
//!
//! ### Client Module (`client`)
//! One connected-client slot: session keys, sequence, replay window and the
//! queue of received payloads.
//!
//! ### Client Manager Module (`client_manager`)
//! The bounded tables behind admission:
//! - Encryption mappings for handshakes in progress
//! - Connect token entries binding each token to one address
//! - Client slots and their lookups by address and id
//! - Timeout sweeps and disconnect bookkeeping
//!
//! ### Args Module (`args`)
//! Command line value parsers shared by the `server` and `mint_token` binaries.
//!
//! ### Network Module (`network`)
//! The [`network::Server`] tick driver: socket ownership, the admission
//! pipeline, keep-alives and outbound frame queueing.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use shared::crypto::generate_key;
//! use std::time::{Duration, Instant};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let public = "127.0.0.1:40000".parse()?;
//!     let mut server = Server::new(ServerConfig::new(0x1234, generate_key(), public))?;
//!     server.listen(public)?;
//!
//!     let start = Instant::now();
//!     let mut ticker = tokio::time::interval(Duration::from_millis(16));
//!     loop {
//!         ticker.tick().await;
//!         server.update(start.elapsed().as_secs_f64());
//!
//!         for index in 0..server.max_clients() {
//!             while let Some((payload, _)) = server.recv_payload(index) {
//!                 server.send_payload(index, &payload)?;
//!             }
//!         }
//!     }
//! }
//! ```

pub mod args;
pub mod client;
pub mod client_manager;
pub mod network;
