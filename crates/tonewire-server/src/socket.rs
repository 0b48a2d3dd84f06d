//! Unix socket listener and packet-framed connections.
//!
//! The listener hands out [`Connection`]s; each carries one peer and is
//! usually split into a read half feeding the dispatcher and a write half
//! owned by an outbound writer task.

use std::path::Path;
use std::sync::Arc;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use tonewire_dispatch::Credentials;
use tonewire_protocol::{Packet, read_frame, write_frame};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Unix socket server accepting packet-framed client connections.
pub struct SocketServer {
    config: ServerConfig,
    listener: UnixListener,
    connection_semaphore: Arc<Semaphore>,
}

impl SocketServer {
    /// Binds to the socket path in the configuration.
    ///
    /// With `cleanup_stale_socket` set, a dead socket file left behind by
    /// a previous run is removed; a live one is reported as in use.
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if socket_path.exists() {
            if !config.cleanup_stale_socket {
                return Err(ServerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            match UnixStream::connect(socket_path).await {
                Ok(_) => {
                    return Err(ServerError::socket_in_use(
                        socket_path.to_string_lossy().to_string(),
                    ));
                }
                Err(_) => {
                    info!(path = %socket_path.display(), "removing stale socket");
                    std::fs::remove_file(socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accepts a single connection, waiting for a slot if the connection
    /// limit is reached.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;

        let (stream, _addr) = self.listener.accept().await?;
        debug!("accepted connection");

        Ok(Connection {
            stream,
            _permit: permit,
        })
    }

    /// Runs the accept loop, spawning the handler for each connection.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(connection) => {
                    tokio::spawn(handler(connection));
                }
                Err(e) => {
                    // Keep accepting; one bad accept is not fatal.
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// Runs the accept loop until the shutdown future completes.
    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
        S: std::future::Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("shutdown signal received");
                Ok(())
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.config.socket_path.exists()
            && let Err(e) = std::fs::remove_file(&self.config.socket_path)
        {
            warn!(
                path = %self.config.socket_path.display(),
                error = %e,
                "failed to remove socket file"
            );
        }
    }
}

/// One client connection.
pub struct Connection {
    stream: UnixStream,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// Returns the peer's credentials from the socket layer.
    pub fn peer_credentials(&self) -> ServerResult<Credentials> {
        let peer = self.stream.peer_cred()?;
        let mut creds = Credentials::new(peer.uid(), peer.gid());
        if let Some(pid) = peer.pid() {
            creds = creds.with_pid(pid);
        }
        Ok(creds)
    }

    /// Reads a single framed packet; `Ok(None)` on clean EOF.
    pub async fn read_packet(&mut self) -> ServerResult<Option<Packet>> {
        Ok(read_frame(&mut self.stream).await?)
    }

    /// Writes a single framed packet.
    pub async fn write_packet(&mut self, packet: &Packet) -> ServerResult<()> {
        Ok(write_frame(&mut self.stream, packet).await?)
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (PacketReader, PacketWriter) {
        let (read, write) = self.stream.into_split();
        (
            PacketReader {
                half: read,
                _permit: self._permit,
            },
            PacketWriter { half: write },
        )
    }
}

/// Read half of a split connection. Holds the connection slot.
pub struct PacketReader {
    half: OwnedReadHalf,
    _permit: OwnedSemaphorePermit,
}

impl PacketReader {
    /// Reads a single framed packet; `Ok(None)` on clean EOF.
    pub async fn read_packet(&mut self) -> ServerResult<Option<Packet>> {
        Ok(read_frame(&mut self.half).await?)
    }
}

/// Write half of a split connection.
pub struct PacketWriter {
    half: OwnedWriteHalf,
}

impl PacketWriter {
    /// Writes a single framed packet.
    pub async fn write_packet(&mut self, packet: &Packet) -> ServerResult<()> {
        Ok(write_frame(&mut self.half, packet).await?)
    }
}
