//! Pending reply bookkeeping types.
//!
//! One [`PendingReply`] records a single outstanding reply expectation: the
//! callback that will consume the outcome and, when a deadline was given,
//! the one-shot timer armed for it. An entry is consumed by exactly one of
//! reply arrival, timeout, explicit unregistration or engine teardown;
//! whichever path wins removes the entry from the registry first, so "entry
//! absent" is the single source of truth for "already resolved".

use tokio::task::JoinHandle;
use tonewire_protocol::TagReader;

use crate::dispatcher::Dispatcher;

/// Opaque cancellation key for pending replies.
///
/// Callers mint one id per owning object and pass it to every
/// [`register_reply`](Dispatcher::register_reply) they issue; when the
/// object goes away,
/// [`unregister_reply`](Dispatcher::unregister_reply) drops all of its
/// outstanding expectations in one call, preventing callbacks into freed
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Mints a process-unique owner id.
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome delivered to a reply callback.
#[derive(Debug)]
pub enum ReplyOutcome<'a> {
    /// A successful reply arrived; the reader is positioned after the
    /// header.
    Reply(TagReader<'a>),
    /// An error reply arrived; the first field is the error code.
    Error(TagReader<'a>),
    /// No reply arrived before the registered deadline.
    TimedOut,
}

impl ReplyOutcome<'_> {
    /// Returns true for the timeout outcome.
    ///
    /// A timeout is indistinguishable from an error reply except through
    /// this check; callers that set deadlines must make it.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Callback consuming the outcome of one pending reply.
///
/// Invoked at most once; dropping it uninvoked (unregistration, teardown)
/// releases whatever state it captured.
pub type ReplyCallback = Box<dyn FnOnce(&Dispatcher, u32, ReplyOutcome<'_>) + Send>;

/// One outstanding reply expectation, keyed by tag in the registry.
///
/// The callback sits behind an `Option` so a resolution path can move it
/// out while the `Drop` impl below still owns the entry.
pub(crate) struct PendingReply {
    pub(crate) owner: OwnerId,
    pub(crate) callback: Option<ReplyCallback>,
    /// One-shot timeout task; aborted by whichever path resolves the entry.
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl PendingReply {
    /// Disarms the entry's timer, if one is still armed.
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Consumes the callback for invocation; `None` once taken.
    pub(crate) fn take_callback(&mut self) -> Option<ReplyCallback> {
        self.callback.take()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.disarm();
    }
}
