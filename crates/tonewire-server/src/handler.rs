//! Per-connection request handling.
//!
//! Each accepted connection gets its own [`Dispatcher`] wired to a handler
//! table for the request commands. Handlers send correlated replies through
//! an outbound packet channel drained by a writer task, so a handler never
//! blocks on the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tonewire_dispatch::{DispatchTable, Dispatcher};
use tonewire_protocol::command::{
    self, COMMAND_AUTH, COMMAND_LOOKUP_SINK, COMMAND_MAX, COMMAND_PING, COMMAND_SET_CLIENT_NAME,
    COMMAND_STAT, error_code,
};
use tonewire_protocol::{PROTOCOL_VERSION, Packet};

use crate::error::ServerResult;
use crate::socket::Connection;

/// One entry in the sink registry.
#[derive(Debug, Clone)]
pub struct SinkInfo {
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

/// State shared across all connections.
pub struct ServerState {
    start: Instant,
    served: AtomicU64,
    sinks: RwLock<Vec<SinkInfo>>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates an empty server state.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            served: AtomicU64::new(0),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a sink, assigning it the next free index.
    pub fn add_sink(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        volume: u32,
        latency_usec: u64,
    ) -> u32 {
        let mut sinks = self.sinks.write().expect("sink registry poisoned");
        let index = sinks.len() as u32;
        sinks.push(SinkInfo {
            index,
            name: name.into(),
            description: description.into(),
            volume,
            latency_usec,
        });
        index
    }

    /// Looks up a sink by name.
    pub fn lookup_sink(&self, name: &str) -> Option<SinkInfo> {
        let sinks = self.sinks.read().expect("sink registry poisoned");
        sinks.iter().find(|s| s.name == name).cloned()
    }

    /// Returns the number of registered sinks.
    pub fn sink_count(&self) -> u32 {
        self.sinks.read().expect("sink registry poisoned").len() as u32
    }

    /// Returns the total number of requests handled.
    pub fn served_total(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Returns the uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn count_served(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-connection state mutated by handlers.
#[derive(Debug, Default)]
struct ConnState {
    client_name: Option<String>,
    authorized: bool,
}

/// Handles one connection's request stream against the shared state.
pub struct ConnectionHandler {
    state: Arc<ServerState>,
    cookie: Option<Vec<u8>>,
}

impl ConnectionHandler {
    /// Creates a handler over the shared state.
    ///
    /// With a cookie set, every command other than auth is refused until
    /// the client has authenticated.
    pub fn new(state: Arc<ServerState>, cookie: Option<Vec<u8>>) -> Self {
        Self { state, cookie }
    }

    /// Processes all requests on the connection until it closes.
    ///
    /// A dispatch error (malformed header, unknown command, bad payload)
    /// closes the transport; application-level failures are answered with
    /// error replies and keep the connection open.
    pub async fn handle_connection(&self, conn: Connection) -> ServerResult<()> {
        let creds = conn.peer_credentials().ok();
        let (mut reader, mut writer) = conn.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = outbound_rx.recv().await {
                if let Err(e) = writer.write_packet(&packet).await {
                    warn!(error = %e, "failed to write reply, dropping connection");
                    break;
                }
            }
        });

        let dispatcher = Dispatcher::new(self.build_table(outbound));

        let result = loop {
            match reader.read_packet().await {
                Ok(Some(packet)) => {
                    if let Err(e) = dispatcher.run(&packet, creds) {
                        warn!(error = %e, "closing connection");
                        break Err(e.into());
                    }
                    self.state.count_served();
                }
                Ok(None) => {
                    debug!("client disconnected");
                    break Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "error reading packet");
                    break Err(e);
                }
            }
        };

        // Dropping the dispatcher drops the handler table and with it the
        // outbound sender, so the writer task flushes what is queued and
        // exits.
        drop(dispatcher);
        let _ = writer_task.await;
        result
    }

    fn build_table(&self, outbound: mpsc::UnboundedSender<Packet>) -> DispatchTable {
        let conn_state = Arc::new(Mutex::new(ConnState::default()));
        let cookie = self.cookie.clone();
        let require_auth = cookie.is_some();

        let out = outbound.clone();
        let cs = conn_state.clone();
        let table = DispatchTable::new(COMMAND_MAX as usize).on(COMMAND_AUTH, move |mut ctx| {
            let offered = ctx.payload.get_bytes()?;
            let cookie_ok = match &cookie {
                Some(expected) => offered == expected.as_slice(),
                None => true,
            };
            // A peer running as the same user as the server may skip the
            // cookie, matching local-trust semantics.
            let uid_ok = ctx
                .creds
                .map(|c| c.uid == unsafe { libc::getuid() })
                .unwrap_or(false);

            if cookie_ok || uid_ok {
                cs.lock().expect("connection state poisoned").authorized = true;
                info!(creds = ?ctx.creds, "client authenticated");
                let mut reply = command::reply_to(ctx.tag);
                reply.put_u32(PROTOCOL_VERSION);
                let _ = out.send(reply.into_packet());
            } else {
                warn!(creds = ?ctx.creds, "authentication refused");
                let _ = out.send(command::error_to(ctx.tag, error_code::ACCESS));
            }
            Ok(())
        });

        let out = outbound.clone();
        let cs = conn_state.clone();
        let table = table.on(COMMAND_SET_CLIENT_NAME, move |mut ctx| {
            if !authorized(&cs, require_auth) {
                let _ = out.send(command::error_to(ctx.tag, error_code::ACCESS));
                return Ok(());
            }
            let name = ctx.payload.get_string()?.to_string();
            debug!(name = %name, "client name set");
            cs.lock().expect("connection state poisoned").client_name = Some(name);
            let _ = out.send(command::reply_to(ctx.tag).into_packet());
            Ok(())
        });

        let out = outbound.clone();
        let cs = conn_state.clone();
        let table = table.on(COMMAND_PING, move |ctx| {
            if !authorized(&cs, require_auth) {
                let _ = out.send(command::error_to(ctx.tag, error_code::ACCESS));
                return Ok(());
            }
            let _ = out.send(command::reply_to(ctx.tag).into_packet());
            Ok(())
        });

        let state = self.state.clone();
        let out = outbound.clone();
        let cs = conn_state.clone();
        let table = table.on(COMMAND_STAT, move |ctx| {
            if !authorized(&cs, require_auth) {
                let _ = out.send(command::error_to(ctx.tag, error_code::ACCESS));
                return Ok(());
            }
            let mut reply = command::reply_to(ctx.tag);
            reply.put_u64(state.uptime_seconds());
            reply.put_u64(state.served_total());
            reply.put_u32(state.sink_count());
            let _ = out.send(reply.into_packet());
            Ok(())
        });

        let state = self.state.clone();
        let out = outbound;
        let cs = conn_state;
        table.on(COMMAND_LOOKUP_SINK, move |mut ctx| {
            if !authorized(&cs, require_auth) {
                let _ = out.send(command::error_to(ctx.tag, error_code::ACCESS));
                return Ok(());
            }
            let name = ctx.payload.get_string()?;
            match state.lookup_sink(name) {
                Some(sink) => {
                    debug!(name = %name, index = sink.index, "sink lookup");
                    let mut reply = command::reply_to(ctx.tag);
                    reply.put_u32(sink.index);
                    reply.put_string(&sink.name);
                    reply.put_string(&sink.description);
                    reply.put_u32(sink.volume);
                    reply.put_u64(sink.latency_usec);
                    let _ = out.send(reply.into_packet());
                }
                None => {
                    debug!(name = %name, "sink not found");
                    let _ = out.send(command::error_to(ctx.tag, error_code::NO_ENTITY));
                }
            }
            Ok(())
        })
    }
}

fn authorized(cs: &Arc<Mutex<ConnState>>, require_auth: bool) -> bool {
    !require_auth || cs.lock().expect("connection state poisoned").authorized
}

/// Creates a connection handler closure for [`SocketServer::run`].
///
/// [`SocketServer::run`]: crate::socket::SocketServer::run
pub fn make_connection_handler(
    state: Arc<ServerState>,
    cookie: Option<Vec<u8>>,
) -> impl Fn(Connection) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
+ Send
+ Sync
+ 'static {
    move |conn| {
        let handler = ConnectionHandler::new(state.clone(), cookie.clone());
        Box::pin(async move {
            if let Err(e) = handler.handle_connection(conn).await {
                warn!(error = %e, "connection handler error");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::socket::SocketServer;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tonewire_protocol::{MessageHeader, TagWriter, command::COMMAND_ERROR, encode_frame};

    async fn send_packet(stream: &mut UnixStream, writer: TagWriter) {
        let framed = encode_frame(&writer.into_packet()).unwrap();
        stream.write_all(&framed).await.unwrap();
    }

    async fn recv_packet(stream: &mut UnixStream) -> Packet {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        Packet::from_vec(payload)
    }

    fn spawn_server(
        state: Arc<ServerState>,
        cookie: Option<Vec<u8>>,
    ) -> (std::path::PathBuf, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("server.sock");
        let config = ServerConfig::new(&socket_path);
        let path = socket_path.clone();
        tokio::spawn(async move {
            let server = SocketServer::new(config).await.unwrap();
            server.run(make_connection_handler(state, cookie)).await
        });
        (path, dir)
    }

    async fn connect(path: &std::path::Path) -> UnixStream {
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("server did not come up");
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = spawn_server(state.clone(), None);
        let mut stream = connect(&path).await;

        send_packet(&mut stream, command::request(COMMAND_PING, 42)).await;
        let reply = recv_packet(&mut stream).await;

        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, command::COMMAND_REPLY);
        assert_eq!(header.tag, 42);
        assert_eq!(state.served_total(), 1);
    }

    #[tokio::test]
    async fn auth_reply_carries_version() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = spawn_server(state, None);
        let mut stream = connect(&path).await;

        let mut req = command::request(COMMAND_AUTH, 1);
        req.put_bytes(b"");
        send_packet(&mut stream, req).await;

        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, command::COMMAND_REPLY);
        assert_eq!(reader.get_u32().unwrap(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn lookup_sink_found_and_missing() {
        let state = Arc::new(ServerState::new());
        state.add_sink("alsa_output.default", "Built-in Audio", 655, 25_000);
        let (path, _dir) = spawn_server(state, None);
        let mut stream = connect(&path).await;

        let mut req = command::request(COMMAND_LOOKUP_SINK, 5);
        req.put_string("alsa_output.default");
        send_packet(&mut stream, req).await;

        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, command::COMMAND_REPLY);
        assert_eq!(header.tag, 5);
        assert_eq!(reader.get_u32().unwrap(), 0);
        assert_eq!(reader.get_string().unwrap(), "alsa_output.default");
        assert_eq!(reader.get_string().unwrap(), "Built-in Audio");
        assert_eq!(reader.get_u32().unwrap(), 655);
        assert_eq!(reader.get_u64().unwrap(), 25_000);

        let mut req = command::request(COMMAND_LOOKUP_SINK, 6);
        req.put_string("no-such-sink");
        send_packet(&mut stream, req).await;

        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, COMMAND_ERROR);
        assert_eq!(header.tag, 6);
        assert_eq!(reader.get_u32().unwrap(), error_code::NO_ENTITY);
    }

    #[tokio::test]
    async fn stat_reports_counters() {
        let state = Arc::new(ServerState::new());
        state.add_sink("a", "A", 0, 0);
        state.add_sink("b", "B", 0, 0);
        let (path, _dir) = spawn_server(state, None);
        let mut stream = connect(&path).await;

        send_packet(&mut stream, command::request(COMMAND_PING, 1)).await;
        recv_packet(&mut stream).await;

        send_packet(&mut stream, command::request(COMMAND_STAT, 2)).await;
        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        MessageHeader::read(&mut reader).unwrap();
        let _uptime = reader.get_u64().unwrap();
        // The ping has been counted by the time its reply was sent.
        assert!(reader.get_u64().unwrap() >= 1);
        assert_eq!(reader.get_u32().unwrap(), 2);
    }

    #[tokio::test]
    async fn set_client_name_acknowledged() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = spawn_server(state, None);
        let mut stream = connect(&path).await;

        let mut req = command::request(COMMAND_SET_CLIENT_NAME, 9);
        req.put_string("mixer-panel");
        send_packet(&mut stream, req).await;

        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, command::COMMAND_REPLY);
        assert_eq!(header.tag, 9);
    }

    #[tokio::test]
    async fn wrong_cookie_same_uid_still_authenticates() {
        // Peer credentials carry our own uid over the local socket, so the
        // uid bypass admits the client even with a bad cookie.
        let state = Arc::new(ServerState::new());
        let (path, _dir) = spawn_server(state, Some(b"secret".to_vec()));
        let mut stream = connect(&path).await;

        let mut req = command::request(COMMAND_AUTH, 1);
        req.put_bytes(b"wrong");
        send_packet(&mut stream, req).await;

        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, command::COMMAND_REPLY);
    }

    #[tokio::test]
    async fn command_refused_before_auth() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = spawn_server(state, Some(b"secret".to_vec()));
        let mut stream = connect(&path).await;

        send_packet(&mut stream, command::request(COMMAND_PING, 3)).await;
        let reply = recv_packet(&mut stream).await;
        let mut reader = reply.reader();
        let header = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(header.command, COMMAND_ERROR);
        assert_eq!(header.tag, 3);
        assert_eq!(reader.get_u32().unwrap(), error_code::ACCESS);
    }

    #[tokio::test]
    async fn unknown_command_closes_connection() {
        let state = Arc::new(ServerState::new());
        let (path, _dir) = spawn_server(state, None);
        let mut stream = connect(&path).await;

        send_packet(&mut stream, command::request(COMMAND_MAX + 10, 1)).await;

        // The server drops the transport without replying.
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
