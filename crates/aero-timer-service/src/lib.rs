//! Deadline scheduler for deferred host-side work.
//!
//! Clients (device models, network workers, UI timers) ask for "run this callback after `delay`"
//! via [`TimerService::request`] and may withdraw the request at any time with
//! [`TimerService::cancel`]. Requests are kept in a binary min-heap keyed by deadline and a single
//! [`OneShotTimer`] is armed for the earliest one.
//!
//! Callbacks are never run on the timer thread. When the timer fires, every due request is handed
//! to the [`aero_dispatch::AsyncDispatcher`] the service was built with, and runs when the
//! dispatcher's owning thread calls `run_callbacks`.
//!
//! Tokens pair a slot index with a per-slot generation, so a token captured before its slot was
//! recycled can never cancel the slot's new occupant.
#![forbid(unsafe_code)]

mod clock;
mod config;
mod driver;
mod error;
mod service;
mod table;
mod token;

pub use clock::{FakeHostClock, HostClock, StdHostClock, Tick};
pub use config::{ConfigError, TimerServiceConfig};
pub use driver::{FireHandler, ManualTimer, OneShotTimer, ThreadTimer};
pub use error::TimerError;
pub use service::TimerService;
pub use token::TimerToken;
