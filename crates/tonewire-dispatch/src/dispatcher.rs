//! The dispatch engine.
//!
//! A [`Dispatcher`] sits between a packet transport and the application
//! logic of one connection. It multiplexes two traffic directions over the
//! same stream: inbound requests, routed to a handler by command code, and
//! replies to requests the local side sent earlier, correlated back to the
//! exact call site through an opaque tag.
//!
//! [`Dispatcher::run`] is the single synchronous entry point, called once
//! per decoded packet. It never suspends: waiting for a reply is expressed
//! by registering a callback with
//! [`register_reply`](Dispatcher::register_reply) and returning, with
//! resolution happening on a later `run` call or a timeout firing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use tonewire_protocol::command::COMMAND_ERROR;
use tonewire_protocol::{MessageHeader, Packet, TagReader};

use crate::creds::Credentials;
use crate::error::{DispatchError, DispatchResult};
use crate::pending::{OwnerId, PendingReply, ReplyCallback, ReplyOutcome};

/// A bound request handler.
///
/// Handlers decide whether and how to reply, typically by encoding a new
/// packet on the same tag; the engine never replies on their behalf.
pub type CommandHandler =
    Arc<dyn Fn(RequestContext<'_>) -> DispatchResult<()> + Send + Sync>;

/// Observer invoked whenever the pending-reply registry drains.
pub type DrainCallback = Arc<dyn Fn(&Dispatcher) + Send + Sync>;

/// Everything a request handler gets to see about one inbound request.
pub struct RequestContext<'a> {
    /// The dispatcher processing the request; usable re-entrantly.
    pub dispatcher: &'a Dispatcher,
    /// The command code that selected this handler.
    pub command: u32,
    /// Correlation tag, passed through unmodified so the handler can send
    /// a correlated reply.
    pub tag: u32,
    /// Field reader positioned after the header.
    pub payload: TagReader<'a>,
    /// Peer credentials for this packet, when the transport supplied them.
    pub creds: Option<Credentials>,
}

/// Immutable table binding command codes to request handlers.
///
/// Indexed directly by wire command code; the size is caller-chosen and
/// codes are bounds-checked at dispatch time, not at construction. A slot
/// with no bound handler is a valid "unhandled" state. Slots at the reply
/// sentinel codes are never consulted.
pub struct DispatchTable {
    slots: Box<[Option<CommandHandler>]>,
}

impl DispatchTable {
    /// Creates a table with `entries` empty slots.
    pub fn new(entries: usize) -> Self {
        Self {
            slots: vec![None; entries].into_boxed_slice(),
        }
    }

    /// Builder: binds `handler` to `command`.
    ///
    /// # Panics
    ///
    /// Panics if `command` is outside the table, or if the slot is already
    /// bound; both indicate a wiring bug in the caller.
    pub fn on<F>(mut self, command: u32, handler: F) -> Self
    where
        F: Fn(RequestContext<'_>) -> DispatchResult<()> + Send + Sync + 'static,
    {
        let slot = self
            .slots
            .get_mut(command as usize)
            .unwrap_or_else(|| panic!("command {command} outside dispatch table"));
        assert!(slot.is_none(), "command {command} bound twice");
        *slot = Some(Arc::new(handler));
        self
    }

    /// Returns the number of slots.
    pub fn entries(&self) -> usize {
        self.slots.len()
    }

    fn lookup(&self, command: u32) -> DispatchResult<&CommandHandler> {
        match self.slots.get(command as usize) {
            None => Err(DispatchError::UnknownCommand { command }),
            Some(None) => Err(DispatchError::UnhandledCommand { command }),
            Some(Some(handler)) => Ok(handler),
        }
    }
}

struct EngineState {
    pending: HashMap<u32, PendingReply>,
    drain: Option<DrainCallback>,
    /// True once the drain observer has been told about the current empty
    /// state; reset whenever the registry becomes non-empty again.
    drain_signalled: bool,
    /// Transient slot, meaningful only inside the dynamic extent of a
    /// `run` call.
    creds: Option<Credentials>,
}

struct Shared {
    table: DispatchTable,
    state: Mutex<EngineState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("dispatcher state poisoned")
    }
}

/// Restores the previous credentials on scope exit, so nested `run` calls
/// see their own packet's credentials and `creds()` never yields stale
/// data once the outermost call returns.
struct CredsScope<'a> {
    shared: &'a Shared,
    prev: Option<Credentials>,
}

impl<'a> CredsScope<'a> {
    fn enter(shared: &'a Shared, creds: Option<Credentials>) -> Self {
        let prev = std::mem::replace(&mut shared.state().creds, creds);
        Self { shared, prev }
    }
}

impl Drop for CredsScope<'_> {
    fn drop(&mut self) {
        self.shared.state().creds = self.prev;
    }
}

/// Tag-correlated command/reply dispatch engine.
///
/// Cheap to clone; clones share one registry and table. The engine is torn
/// down when the last clone drops: every armed timer is cancelled and
/// every pending entry is released without invoking its reply callback,
/// since a destroyed dispatcher cannot deliver outcomes.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Builds a dispatcher around an immutable handler table.
    pub fn new(table: DispatchTable) -> Self {
        Self {
            shared: Arc::new(Shared {
                table,
                state: Mutex::new(EngineState {
                    pending: HashMap::new(),
                    drain: None,
                    drain_signalled: true,
                    creds: None,
                }),
            }),
        }
    }

    /// Processes one inbound packet.
    ///
    /// Decodes the command/tag header, then routes: a reply-sentinel
    /// command resolves the pending entry for `tag` (stale tags are
    /// silently dropped); any other command is bounds-checked against the
    /// table and handed to its handler. `creds`, when given, are visible
    /// through [`creds`](Self::creds) and the handler context for the
    /// duration of this call only.
    ///
    /// Handlers and reply callbacks may re-enter the engine: nested `run`,
    /// [`register_reply`](Self::register_reply) and
    /// [`unregister_reply`](Self::unregister_reply) calls are all safe.
    pub fn run(&self, packet: &Packet, creds: Option<Credentials>) -> DispatchResult<()> {
        let mut reader = packet.reader();
        let header =
            MessageHeader::read(&mut reader).map_err(DispatchError::MalformedHeader)?;

        let _scope = CredsScope::enter(&self.shared, creds);

        if header.is_reply() {
            self.run_reply(header, reader);
            Ok(())
        } else {
            self.run_request(header, reader, creds)
        }
    }

    fn run_reply(&self, header: MessageHeader, reader: TagReader<'_>) {
        let entry = self.shared.state().pending.remove(&header.tag);
        let Some(mut entry) = entry else {
            // Late or duplicate delivery after the tag already resolved;
            // expected under timeout races.
            debug!(tag = header.tag, "dropping reply with no pending entry");
            return;
        };
        entry.disarm();

        let outcome = if header.command == COMMAND_ERROR {
            ReplyOutcome::Error(reader)
        } else {
            ReplyOutcome::Reply(reader)
        };
        if let Some(callback) = entry.take_callback() {
            callback(self, header.tag, outcome);
        }
        self.notify_drained();
    }

    fn run_request(
        &self,
        header: MessageHeader,
        reader: TagReader<'_>,
        creds: Option<Credentials>,
    ) -> DispatchResult<()> {
        let handler = self.shared.table.lookup(header.command)?.clone();
        handler(RequestContext {
            dispatcher: self,
            command: header.command,
            tag: header.tag,
            payload: reader,
            creds,
        })
    }

    /// Registers a reply expectation for `tag`.
    ///
    /// The callback is invoked exactly once with the reply, the error
    /// reply or [`ReplyOutcome::TimedOut`] when `timeout` elapses first;
    /// it is dropped uninvoked if the entry is unregistered or the engine
    /// is torn down. `owner` keys later cancellation through
    /// [`unregister_reply`](Self::unregister_reply).
    ///
    /// # Panics
    ///
    /// Panics if `tag` already has a live entry: tags are caller-assigned
    /// and a collision indicates a correlation bug.
    pub fn register_reply<F>(
        &self,
        tag: u32,
        owner: OwnerId,
        timeout: Option<Duration>,
        callback: F,
    ) where
        F: FnOnce(&Dispatcher, u32, ReplyOutcome<'_>) + Send + 'static,
    {
        let mut state = self.shared.state();
        assert!(
            !state.pending.contains_key(&tag),
            "duplicate pending reply tag {tag}"
        );

        // Armed while the registry lock is held: a near-zero deadline
        // firing on another worker blocks in `timeout_fired` until the
        // entry below is visible.
        let timer = timeout.map(|deadline| {
            let weak = Arc::downgrade(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Some(shared) = weak.upgrade() {
                    Dispatcher { shared }.timeout_fired(tag);
                }
            })
        });

        state.drain_signalled = false;
        state.pending.insert(
            tag,
            PendingReply {
                owner,
                callback: Some(Box::new(callback) as ReplyCallback),
                timer,
            },
        );
        debug!(tag, has_timeout = timeout.is_some(), "registered pending reply");
    }

    fn timeout_fired(&self, tag: u32) {
        let entry = self.shared.state().pending.remove(&tag);
        // Absence means a reply or unregistration won the race; the entry
        // is already resolved and this firing is a no-op.
        let Some(mut entry) = entry else {
            return;
        };
        debug!(tag, "pending reply timed out");
        if let Some(callback) = entry.take_callback() {
            callback(self, tag, ReplyOutcome::TimedOut);
        }
        self.notify_drained();
    }

    /// Removes every pending entry registered under `owner`.
    ///
    /// Timers are disarmed and captured state is released without invoking
    /// any reply callback; there is no reply to deliver. Returns the
    /// number of entries removed.
    pub fn unregister_reply(&self, owner: OwnerId) -> usize {
        let removed: Vec<PendingReply> = {
            let mut state = self.shared.state();
            let tags: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(tag, _)| *tag)
                .collect();
            tags.iter()
                .filter_map(|tag| state.pending.remove(tag))
                .collect()
        };

        let count = removed.len();
        if count > 0 {
            debug!(count, "unregistered pending replies");
            drop(removed);
            self.notify_drained();
        }
        count
    }

    /// Returns true while at least one reply expectation is outstanding.
    pub fn is_pending(&self) -> bool {
        !self.shared.state().pending.is_empty()
    }

    /// Stores the drain observer, replacing any previous one.
    ///
    /// It fires once on every transition of the registry from non-empty
    /// to empty caused by a reply, a timeout or an unregistration; never
    /// as a result of registration.
    pub fn set_drain_callback<F>(&self, callback: F)
    where
        F: Fn(&Dispatcher) + Send + Sync + 'static,
    {
        self.shared.state().drain = Some(Arc::new(callback));
    }

    /// Removes the drain observer.
    pub fn clear_drain_callback(&self) {
        self.shared.state().drain = None;
    }

    /// Returns the credentials of the packet currently being processed.
    ///
    /// Outside the dynamic extent of a [`run`](Self::run) call this is
    /// `None`, never stale data.
    pub fn creds(&self) -> Option<Credentials> {
        self.shared.state().creds
    }

    fn notify_drained(&self) {
        let callback = {
            let mut state = self.shared.state();
            if !state.pending.is_empty() || state.drain_signalled {
                return;
            }
            state.drain_signalled = true;
            state.drain.clone()
        };
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Dispatcher")
            .field("table_entries", &self.shared.table.entries())
            .field("pending", &state.pending.len())
            .finish()
    }
}
