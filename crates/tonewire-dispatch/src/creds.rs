//! Peer credentials.

/// Identity of the peer on the other end of the transport, as reported by
/// the socket layer (`SO_PEERCRED` on Linux).
///
/// The engine never interprets credentials; it only scopes them to the
/// packet being processed so handlers can make access decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Peer user id.
    pub uid: u32,
    /// Peer group id.
    pub gid: u32,
    /// Peer process id, when the platform reports one.
    pub pid: Option<i32>,
}

impl Credentials {
    /// Creates credentials from a uid/gid pair.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            pid: None,
        }
    }

    /// Builder: attach the peer process id.
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }
}
