//! Server configuration.

use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Whether to remove a stale socket file on startup.
    pub cleanup_stale_socket: bool,

    /// Auth cookie clients must present. When `None`, any peer on the
    /// socket is accepted; a same-uid peer is accepted either way.
    pub cookie: Option<Vec<u8>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: 64,
            cleanup_stale_socket: true,
            cookie: None,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Builder: require an auth cookie.
    pub fn with_cookie(mut self, cookie: impl Into<Vec<u8>>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }
}

/// Returns the default socket path.
///
/// Uses `$XDG_RUNTIME_DIR/tonewire.sock` if available, otherwise falls
/// back to `/tmp/tonewire-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("tonewire.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/tonewire-{}.sock", uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert!(config.socket_path.to_string_lossy().contains("tonewire"));
        assert_eq!(config.max_connections, 64);
        assert!(config.cleanup_stale_socket);
        assert!(config.cookie.is_none());
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::new("/custom/path.sock")
            .with_max_connections(8)
            .with_cleanup_stale_socket(false)
            .with_cookie(&b"secret"[..]);

        assert_eq!(config.socket_path, PathBuf::from("/custom/path.sock"));
        assert_eq!(config.max_connections, 8);
        assert!(!config.cleanup_stale_socket);
        assert_eq!(config.cookie.as_deref(), Some(&b"secret"[..]));
    }

    #[test]
    fn default_socket_path_format() {
        let path = default_socket_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("tonewire"));
        assert!(path_str.ends_with(".sock"));
    }
}
