//! Deferred callback queue ("async dispatcher") for the emulator core.
//!
//! Producers on any thread append zero-argument callbacks with [`AsyncDispatcher::queue`]; a
//! single owning thread (normally the UI/message loop) drains them with
//! [`AsyncDispatcher::run_callbacks`]. A wake hook fires whenever the queue goes from empty to
//! non-empty so the owning thread knows it has to pump.
//!
//! Every queued callback can be cancelled in O(1) through the [`DispatchToken`] it was queued
//! with. Tokens are positions in a monotonically advancing FIFO, so a token for a callback that
//! already ran can never alias a newer entry.
#![forbid(unsafe_code)]

mod dispatcher;
mod sync;
mod token;

pub use dispatcher::{AsyncDispatcher, Callback, WakeHook};
pub use token::DispatchToken;
