//! Tag-correlated command/reply dispatch for the tonewire protocol.
//!
//! The [`Dispatcher`] sits between a packet transport and application
//! logic, multiplexing two directions over one connection:
//!
//! - inbound **requests**, routed to a handler through an immutable
//!   [`DispatchTable`] indexed by command code;
//! - **replies** to requests the local side sent earlier, correlated back
//!   to their call site by tag through the pending-reply registry, with
//!   optional per-entry timeouts.
//!
//! The engine owns the hard edges of that job: timer-based cancellation,
//! exactly-once callback delivery under races between arrival and timeout,
//! release of caller-captured state on early disconnect, and drain
//! detection used to sequence connection teardown.
//!
//! # Example
//!
//! ```rust
//! use tonewire_dispatch::{DispatchTable, Dispatcher, OwnerId};
//! use tonewire_protocol::command::{self, COMMAND_MAX, COMMAND_PING};
//!
//! let table = DispatchTable::new(COMMAND_MAX as usize).on(COMMAND_PING, |_ctx| {
//!     // A real handler would send command::reply_to(ctx.tag) back.
//!     Ok(())
//! });
//! let pd = Dispatcher::new(table);
//!
//! // Waiting for a reply: register, send, resolve later.
//! pd.register_reply(1, OwnerId::new(), None, |_pd, _tag, outcome| {
//!     assert!(!outcome.is_timed_out());
//! });
//! let reply = command::reply_to(1).into_packet();
//! pd.run(&reply, None).unwrap();
//! assert!(!pd.is_pending());
//! ```

mod creds;
mod dispatcher;
mod error;
mod pending;

pub use creds::Credentials;
pub use dispatcher::{
    CommandHandler, DispatchTable, Dispatcher, DrainCallback, RequestContext,
};
pub use error::{DispatchError, DispatchResult};
pub use pending::{OwnerId, ReplyCallback, ReplyOutcome};
