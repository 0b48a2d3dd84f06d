//! Unix socket client for the tonewire daemon.
//!
//! One connection carries many concurrent requests. Tags are allocated
//! monotonically, each request registers a pending-reply entry with the
//! dispatch engine, and the reply outcome is bridged to the awaiting
//! caller through a oneshot channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tonewire_dispatch::{DispatchTable, Dispatcher, OwnerId, ReplyOutcome};
use tonewire_protocol::command::{
    COMMAND_AUTH, COMMAND_LOOKUP_SINK, COMMAND_MAX, COMMAND_PING, COMMAND_SET_CLIENT_NAME,
    COMMAND_STAT,
};
use tonewire_protocol::{Packet, TagReader, TagWriter, command, read_frame, write_frame};

use crate::error::{ClientError, ClientResult};

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the server socket.
    pub socket_path: PathBuf,
    /// Per-request reply timeout.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: tonewire_server::default_socket_path(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Creates a config for the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Sets the per-request reply timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Counters returned by a stat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Server uptime in seconds.
    pub uptime_seconds: u64,
    /// Total requests the server has handled.
    pub served: u64,
    /// Number of registered sinks.
    pub sinks: u32,
}

/// A sink record returned by a lookup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDetails {
    /// Server-assigned sink index.
    pub index: u32,
    /// Unique sink name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Volume in per-mille of full scale.
    pub volume: u32,
    /// Reported latency in microseconds.
    pub latency_usec: u64,
}

/// Client for the tonewire server over a Unix socket.
pub struct SocketClient {
    dispatcher: Dispatcher,
    outbound: mpsc::UnboundedSender<Packet>,
    owner: OwnerId,
    next_tag: AtomicU32,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    socket_path: PathBuf,
}

impl SocketClient {
    /// Connects to the server and starts the reader and writer tasks.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| {
                ClientError::Connection(format!(
                    "failed to connect to {}: {e}",
                    config.socket_path.display()
                ))
            })?;
        debug!(socket = %config.socket_path.display(), "connected");

        let (mut read_half, mut write_half) = stream.into_split();

        // The client sends requests only, so the table stays empty and
        // every inbound packet is expected to be a correlated reply.
        let dispatcher = Dispatcher::new(DispatchTable::new(COMMAND_MAX as usize));
        let owner = OwnerId::new();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_dispatcher = dispatcher.clone();
        let reader_closed = closed.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(packet)) => {
                        if let Err(e) = reader_dispatcher.run(&packet, None) {
                            warn!(error = %e, "dropping connection on dispatch error");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "read error");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Release everything still outstanding so awaiting callers
            // observe the close instead of hanging until their timeouts.
            let released = reader_dispatcher.unregister_reply(owner);
            if released > 0 {
                debug!(released, "released pending requests on close");
            }
        });

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &packet).await {
                    warn!(error = %e, "write failed, dropping connection");
                    break;
                }
            }
        });

        Ok(Self {
            dispatcher,
            outbound,
            owner,
            next_tag: AtomicU32::new(0),
            request_timeout: config.request_timeout,
            closed,
            reader_task,
            writer_task,
            socket_path: config.socket_path,
        })
    }

    /// Returns the socket path this client is connected to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns true if any request is still awaiting its reply.
    pub fn is_pending(&self) -> bool {
        self.dispatcher.is_pending()
    }

    /// Sends one request and awaits its reply payload.
    ///
    /// The success payload is returned with the header already consumed;
    /// error replies, timeouts and connection loss map to [`ClientError`].
    async fn roundtrip<F>(&self, command: u32, fill: F) -> ClientResult<Vec<u8>>
    where
        F: FnOnce(&mut TagWriter),
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut request = command::request(command, tag);
        fill(&mut request);

        let (reply_tx, reply_rx) = oneshot::channel::<ClientResult<Vec<u8>>>();
        self.dispatcher.register_reply(
            tag,
            self.owner,
            Some(self.request_timeout),
            move |_dispatcher, _tag, outcome| {
                let result = match outcome {
                    ReplyOutcome::Reply(reader) => Ok(reader.remaining().to_vec()),
                    ReplyOutcome::Error(mut reader) => match reader.get_u32() {
                        Ok(code) => Err(ClientError::Reply { code }),
                        Err(e) => Err(ClientError::Protocol(e)),
                    },
                    ReplyOutcome::TimedOut => Err(ClientError::Timeout),
                };
                let _ = reply_tx.send(result);
            },
        );

        if self.outbound.send(request.into_packet()).is_err() {
            // The entry just registered is collected by its timeout timer
            // or by the reader's close sweep.
            return Err(ClientError::Closed);
        }

        // A dropped sender means the entry was released without a reply:
        // engine teardown or the reader's close path.
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Authenticates the connection; returns the server protocol version.
    pub async fn auth(&self, cookie: &[u8]) -> ClientResult<u32> {
        let payload = self
            .roundtrip(COMMAND_AUTH, |w| w.put_bytes(cookie))
            .await?;
        let mut reader = TagReader::new(&payload);
        Ok(reader.get_u32()?)
    }

    /// Tells the server this client's application name.
    pub async fn set_client_name(&self, name: &str) -> ClientResult<()> {
        self.roundtrip(COMMAND_SET_CLIENT_NAME, |w| w.put_string(name))
            .await?;
        Ok(())
    }

    /// Liveness probe.
    pub async fn ping(&self) -> ClientResult<()> {
        self.roundtrip(COMMAND_PING, |_| {}).await?;
        Ok(())
    }

    /// Queries server counters.
    pub async fn stat(&self) -> ClientResult<ServerStats> {
        let payload = self.roundtrip(COMMAND_STAT, |_| {}).await?;
        let mut reader = TagReader::new(&payload);
        Ok(ServerStats {
            uptime_seconds: reader.get_u64()?,
            served: reader.get_u64()?,
            sinks: reader.get_u32()?,
        })
    }

    /// Looks up a sink by name.
    pub async fn lookup_sink(&self, name: &str) -> ClientResult<SinkDetails> {
        let payload = self
            .roundtrip(COMMAND_LOOKUP_SINK, |w| w.put_string(name))
            .await?;
        let mut reader = TagReader::new(&payload);
        Ok(SinkDetails {
            index: reader.get_u32()?,
            name: reader.get_string()?.to_string(),
            description: reader.get_string()?.to_string(),
            volume: reader.get_u32()?,
            latency_usec: reader.get_u64()?,
        })
    }

    /// Waits until no request is awaiting a reply.
    ///
    /// Settlement includes replies, error replies and timeouts; requests
    /// issued after this call do not extend the wait.
    pub async fn drained(&self) {
        if !self.dispatcher.is_pending() {
            return;
        }

        let (drained_tx, drained_rx) = oneshot::channel::<()>();
        let slot = Mutex::new(Some(drained_tx));
        self.dispatcher.set_drain_callback(move |_| {
            if let Ok(mut slot) = slot.lock()
                && let Some(tx) = slot.take()
            {
                let _ = tx.send(());
            }
        });

        // The registry may have emptied between the check and callback
        // installation; the transition would already have passed.
        if !self.dispatcher.is_pending() {
            self.dispatcher.clear_drain_callback();
            return;
        }

        let _ = drained_rx.await;
        self.dispatcher.clear_drain_callback();
    }
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("socket_path", &self.socket_path)
            .field("pending", &self.dispatcher.is_pending())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        // The reader holds a dispatcher handle; aborting it lets engine
        // teardown release whatever is still pending.
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tonewire_protocol::command::error_code;
    use tonewire_server::{ServerConfig, ServerState, SocketServer, make_connection_handler};

    async fn start_server(
        state: Arc<ServerState>,
        cookie: Option<Vec<u8>>,
    ) -> (PathBuf, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("tonewire.sock");
        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();
        tokio::spawn(async move { server.run(make_connection_handler(state, cookie)).await });
        (socket_path, dir)
    }

    #[tokio::test]
    async fn auth_then_ping() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = start_server(state, None).await;

        let client = SocketClient::connect(ClientConfig::new(&path)).await.unwrap();
        let version = client.auth(b"").await.unwrap();
        assert_eq!(version, tonewire_protocol::PROTOCOL_VERSION);
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn lookup_sink_end_to_end() {
        let state = Arc::new(ServerState::new());
        state.add_sink("alsa_output.default", "Built-in Audio", 655, 25_000);
        let (path, _dir) = start_server(state, None).await;

        let client = SocketClient::connect(ClientConfig::new(&path)).await.unwrap();
        let sink = client.lookup_sink("alsa_output.default").await.unwrap();
        assert_eq!(sink.index, 0);
        assert_eq!(sink.description, "Built-in Audio");
        assert_eq!(sink.volume, 655);
        assert_eq!(sink.latency_usec, 25_000);
    }

    #[tokio::test]
    async fn missing_sink_is_a_reply_error() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = start_server(state, None).await;

        let client = SocketClient::connect(ClientConfig::new(&path)).await.unwrap();
        let err = client.lookup_sink("nope").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Reply {
                code: error_code::NO_ENTITY
            }
        ));
    }

    #[tokio::test]
    async fn stat_reflects_traffic() {
        let state = Arc::new(ServerState::new());
        state.add_sink("a", "A", 0, 0);
        let (path, _dir) = start_server(state, None).await;

        let client = SocketClient::connect(ClientConfig::new(&path)).await.unwrap();
        client.ping().await.unwrap();
        client.set_client_name("stat-test").await.unwrap();

        let stats = client.stat().await.unwrap();
        assert!(stats.served >= 2);
        assert_eq!(stats.sinks, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_correlate() {
        let state = Arc::new(ServerState::new());
        state.add_sink("left", "Left", 100, 1);
        state.add_sink("right", "Right", 200, 2);
        let (path, _dir) = start_server(state, None).await;

        let client = SocketClient::connect(ClientConfig::new(&path)).await.unwrap();
        let (left, right, _) = tokio::join!(
            client.lookup_sink("left"),
            client.lookup_sink("right"),
            client.ping(),
        );
        assert_eq!(left.unwrap().volume, 100);
        assert_eq!(right.unwrap().volume, 200);
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        // A raw listener that accepts and then stays silent.
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("mute.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let (_stream, _addr) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let config =
            ClientConfig::new(&socket_path).with_request_timeout(Duration::from_millis(100));
        let client = SocketClient::connect(config).await.unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(!client.is_pending());
    }

    #[tokio::test]
    async fn server_disconnect_fails_waiters() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("flaky.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let (stream, _addr) = listener.accept().await.unwrap();
            // Wait for the request bytes, then hang up without replying.
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
        });

        let config =
            ClientConfig::new(&socket_path).with_request_timeout(Duration::from_secs(30));
        let client = SocketClient::connect(config).await.unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }

    #[tokio::test]
    async fn drained_waits_for_settlement() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = start_server(state, None).await;

        let client = SocketClient::connect(ClientConfig::new(&path)).await.unwrap();

        // Nothing outstanding: returns immediately.
        client.drained().await;

        let (ping, pong, _) = tokio::join!(client.ping(), client.ping(), client.drained());
        ping.unwrap();
        pong.unwrap();
        assert!(!client.is_pending());
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let err = SocketClient::connect(ClientConfig::new("/nonexistent/tonewire.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }
}
