//! Deferred-execution core of the emulator host.
//!
//! Bundles the [`AsyncDispatcher`] callback queue with a [`TimerService`] that delivers through
//! it. The thread that owns a [`DeferredCore`] installs a wake hook, waits for it, and then calls
//! [`DeferredCore::run_callbacks`]; every other thread only queues or schedules work.
//!
//! ```no_run
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use aero_deferred::{DeferredCore, TimerServiceConfig, TimerToken};
//!
//! let (wake_tx, wake_rx) = mpsc::channel::<()>();
//! let wake_tx = std::sync::Mutex::new(wake_tx);
//! let core = DeferredCore::new(TimerServiceConfig::default(), move || {
//!     let _ = wake_tx.lock().unwrap().send(());
//! })?;
//!
//! let mut token = TimerToken::new();
//! core.timers()
//!     .request(&mut token, Duration::from_millis(100), || println!("tick"));
//!
//! while wake_rx.recv().is_ok() {
//!     core.run_callbacks();
//! }
//! # Ok::<(), aero_deferred::CoreError>(())
//! ```
#![forbid(unsafe_code)]

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

pub use aero_dispatch::{AsyncDispatcher, Callback, DispatchToken, WakeHook};
pub use aero_timer_service::{
    ConfigError, FakeHostClock, FireHandler, HostClock, ManualTimer, OneShotTimer, StdHostClock,
    ThreadTimer, Tick, TimerError, TimerService, TimerServiceConfig, TimerToken,
};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid timer configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("timer service error: {0}")]
    Timer(#[from] TimerError),
}

pub struct DeferredCore {
    timers: TimerService,
    dispatcher: Arc<AsyncDispatcher>,
}

impl DeferredCore {
    /// Builds a dispatcher with `wake` as its wake hook and a timer service on a dedicated host
    /// thread delivering into it.
    ///
    /// An invalid `config` is reported as [`CoreError::Config`], as it is from
    /// [`from_env`](Self::from_env).
    pub fn new<W>(config: TimerServiceConfig, wake: W) -> Result<Self, CoreError>
    where
        W: Fn() + Send + Sync + 'static,
    {
        config.validate()?;
        let dispatcher = Arc::new(AsyncDispatcher::with_wake_callback(wake));
        let timers = TimerService::new(Arc::clone(&dispatcher), config)?;
        debug!(config = ?timers.config(), "deferred core started");
        Ok(Self { timers, dispatcher })
    }

    /// Like [`new`](Self::new), with the timer configuration read from the environment.
    pub fn from_env<W>(wake: W) -> Result<Self, CoreError>
    where
        W: Fn() + Send + Sync + 'static,
    {
        let config = TimerServiceConfig::from_env()?;
        Self::new(config, wake)
    }

    pub fn dispatcher(&self) -> &Arc<AsyncDispatcher> {
        &self.dispatcher
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// Drains the callback queue on the calling thread. Returns the number of callbacks run.
    pub fn run_callbacks(&self) -> usize {
        self.dispatcher.run_callbacks()
    }

    /// Shuts the timer service down. Callbacks already queued through
    /// [`dispatcher`](Self::dispatcher) directly are left alone.
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}

impl std::fmt::Debug for DeferredCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCore")
            .field("timers", &self.timers)
            .field("queued", &self.dispatcher.len())
            .finish()
    }
}
