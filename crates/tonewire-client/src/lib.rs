//! Socket client for the tonewire daemon.
//!
//! Connects over a Unix socket, allocates correlation tags, and awaits
//! reply outcomes through the dispatch engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use tonewire_client::{ClientConfig, SocketClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SocketClient::connect(ClientConfig::default()).await?;
//!     client.auth(b"").await?;
//!     client.set_client_name("mixer-panel").await?;
//!     let sink = client.lookup_sink("alsa_output.default").await?;
//!     println!("{} at index {}", sink.description, sink.index);
//!     Ok(())
//! }
//! ```

mod error;
mod socket;

pub use error::{ClientError, ClientResult};
pub use socket::{ClientConfig, ServerStats, SinkDetails, SocketClient};
