//! # centrifuge-client
//!
//! Async Rust client for Centrifugo-style real-time messaging servers.
//!
//! The crate implements the client session engine: a connection
//! lifecycle state machine, a command/reply correlator, a subscription
//! registry with automatic replay and recovery after reconnects, a
//! jittered reconnection controller, a token-refresh scheduler and a
//! router for server-initiated pushes. Transport is WebSocket
//! (`tokio-tungstenite`) carrying varint length-delimited Protobuf
//! frames, with a newline-delimited JSON encoding available for
//! debugging.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use centrifuge_client::client::Client;
//! use centrifuge_client::config::Config;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(
//!     "ws://localhost:8000/connection/websocket",
//!     Config::new().with_token("secret"),
//! );
//! client.connect().await?;
//!
//! let sub = client.new_subscription("news")?;
//! sub.on_publication(|publication| println!("got: {:?}", publication.data));
//! sub.subscribe().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: the client facade and connection engine
//! - [`subscription`]: channel subscriptions
//! - [`config`]: client/subscription configuration and backoff
//! - [`protocol`]: command, reply and push types
//! - [`errors`]: error types
//! - [`metrics`]: session counters
//! - [`utils`]: frame codec helpers

pub mod client;
pub mod config;
pub mod errors;
mod events;
pub mod metrics;
pub mod protocol;
pub mod subscription;
pub mod utils;
