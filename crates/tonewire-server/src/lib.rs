//! Control daemon glue for the tonewire protocol.
//!
//! This crate provides:
//! - A Unix socket listener handing out packet-framed connections
//! - A per-connection [`Dispatcher`](tonewire_dispatch::Dispatcher) routing
//!   requests to handlers over a shared sink registry
//! - Peer credential capture from the socket layer
//! - Structured logging setup
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tonewire_server::{ServerConfig, ServerState, SocketServer, make_connection_handler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = Arc::new(ServerState::new());
//!     state.add_sink("alsa_output.default", "Built-in Audio", 655, 25_000);
//!
//!     let config = ServerConfig::default();
//!     let cookie = config.cookie.clone();
//!     let server = SocketServer::new(config).await?;
//!     server.run(make_connection_handler(state, cookie)).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod handler;
mod socket;
mod tracing;

pub use config::{ServerConfig, default_socket_path};
pub use error::{ServerError, ServerResult};
pub use handler::{ConnectionHandler, ServerState, SinkInfo, make_connection_handler};
pub use socket::{Connection, PacketReader, PacketWriter, SocketServer};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
