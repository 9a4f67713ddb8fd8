#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aero_deferred::{DeferredCore, TimerServiceConfig};
use anyhow::{anyhow, Result};

/// Tick used by the integration tests; small enough that a test runs in milliseconds.
pub const TEST_TICK: Duration = Duration::from_millis(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A [`DeferredCore`] plus the receiving end of its wake hook, standing in for a host message
/// loop.
pub struct EventLoop {
    pub core: Arc<DeferredCore>,
    wakes: Receiver<()>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_config(TimerServiceConfig {
            tick: TEST_TICK,
            ..TimerServiceConfig::default()
        })
    }

    pub fn with_config(config: TimerServiceConfig) -> Result<Self> {
        init_tracing();
        let (tx, wakes) = mpsc::channel();
        let tx = Mutex::new(tx);
        let core = DeferredCore::new(config, move || {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(());
            }
        })?;
        Ok(Self {
            core: Arc::new(core),
            wakes,
        })
    }

    /// Pumps callbacks whenever the wake hook fires until `done` holds. Returns the number of
    /// callbacks run.
    pub fn pump_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut ran = self.core.run_callbacks();
        while !done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wakes.recv_timeout(remaining) {
                Ok(()) => ran += self.core.run_callbacks(),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(anyhow!("event loop did not settle within {timeout:?}"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("wake hook dropped"))
                }
            }
        }
        Ok(ran)
    }

    /// Pumps for `period` regardless of what happens.
    pub fn pump_for(&self, period: Duration) -> usize {
        let deadline = Instant::now() + period;
        let mut ran = self.core.run_callbacks();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ran;
            }
            match self.wakes.recv_timeout(remaining) {
                Ok(()) => ran += self.core.run_callbacks(),
                Err(_) => return ran + self.core.run_callbacks(),
            }
        }
    }
}
