use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use aero_dispatch::{AsyncDispatcher, Callback, DispatchToken};
use tracing::{debug, trace};

use crate::clock::{duration_to_ticks, ticks_to_duration, HostClock, StdHostClock, Tick};
use crate::config::TimerServiceConfig;
use crate::driver::{OneShotTimer, ThreadTimer};
use crate::error::TimerError;
use crate::table::{Released, TimerTable};
use crate::token::TimerToken;

struct State {
    table: TimerTable,
    /// Bumped on every arm and disarm; a fire carrying any other value is stale.
    arm_generation: u64,
    /// Deadline the one-shot timer is currently armed for.
    armed_deadline: Option<Tick>,
    shut_down: bool,
}

struct Shared {
    dispatcher: Arc<AsyncDispatcher>,
    clock: Arc<dyn HostClock>,
    timer: Arc<dyn OneShotTimer>,
    config: TimerServiceConfig,
    state: Mutex<State>,
}

/// Deadline scheduler that delivers callbacks through an [`AsyncDispatcher`].
///
/// All methods may be called from any thread, including from inside a callback that the
/// dispatcher is running. Dropping the service shuts it down; see [`TimerService::shutdown`].
pub struct TimerService {
    shared: Arc<Shared>,
}

impl TimerService {
    /// Creates a service driven by the host monotonic clock and a dedicated timer thread.
    pub fn new(
        dispatcher: Arc<AsyncDispatcher>,
        config: TimerServiceConfig,
    ) -> Result<Self, TimerError> {
        let clock = Arc::new(StdHostClock::new(config.tick));
        Self::with_parts(dispatcher, config, clock, Arc::new(ThreadTimer::new()))
    }

    /// Creates a service with an explicit clock and one-shot timer.
    pub fn with_parts(
        dispatcher: Arc<AsyncDispatcher>,
        config: TimerServiceConfig,
        clock: Arc<dyn HostClock>,
        timer: Arc<dyn OneShotTimer>,
    ) -> Result<Self, TimerError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            dispatcher,
            clock,
            timer,
            config,
            state: Mutex::new(State {
                table: TimerTable::new(),
                arm_generation: 0,
                armed_deadline: None,
                shut_down: false,
            }),
        });

        let weak = Arc::downgrade(&shared);
        shared.timer.start(Box::new(move |generation| {
            if let Some(shared) = weak.upgrade() {
                shared.on_timer_fire(generation);
            }
        }))?;

        Ok(Self { shared })
    }

    /// Schedules `callback` to run on the dispatcher's thread once `delay` has elapsed.
    ///
    /// `delay` is clamped to [`TimerServiceConfig::max_delay`] and rounded to the nearest tick.
    /// A request already held in `token` is cancelled first.
    pub fn request<F>(&self, token: &mut TimerToken, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = delay.min(self.shared.config.max_delay);
        let ticks = duration_to_ticks(delay, self.shared.config.tick);
        self.shared.request(token, ticks, Box::new(callback));
    }

    /// Like [`request`](Self::request), with the delay given in whole ticks.
    pub fn request_ticks<F>(&self, token: &mut TimerToken, ticks: Tick, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let max = duration_to_ticks(self.shared.config.max_delay, self.shared.config.tick);
        self.shared.request(token, ticks.min(max), Box::new(callback));
    }

    /// Cancels the request held in `token` and resets `token` to `0`.
    ///
    /// Safe to call with a zero, stale or already-cancelled token. A request whose deadline has
    /// passed but whose callback has not started yet is still cancelled.
    pub fn cancel(&self, token: &mut TimerToken) {
        self.shared.cancel(token);
    }

    /// Stops the timer, waits for an in-progress fire to finish and drops every pending callback
    /// without running it. Requests made afterwards are ignored. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn now(&self) -> Tick {
        self.shared.clock.now()
    }

    /// Requests that have neither run nor been cancelled, including ones already handed to the
    /// dispatcher.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().table.len()
    }

    pub fn next_deadline(&self) -> Option<Tick> {
        self.shared.lock().table.next_deadline()
    }

    pub fn config(&self) -> &TimerServiceConfig {
        &self.shared.config
    }

    pub fn dispatcher(&self) -> &Arc<AsyncDispatcher> {
        &self.shared.dispatcher
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TimerService")
            .field("pending", &state.table.len())
            .field("armed_deadline", &state.armed_deadline)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn request(&self, token: &TimerToken, ticks: Tick, callback: Callback) {
        let mut released = Vec::new();
        {
            let mut state = self.lock();
            if let Some(prev) = state.table.cancel(token.raw()) {
                released.push(prev);
            }

            if state.shut_down {
                debug!("timer service: request after shutdown ignored");
                token.clear();
                drop(state);
                drop(callback);
                self.dispose(released);
                return;
            }

            let now = self.clock.now();
            let deadline = now.saturating_add(ticks);
            let (raw, at_root) = state.table.insert(deadline, callback, token.share());
            token.set(raw);
            trace!(token = raw, deadline, now, "timer service: request armed");

            if at_root && state.armed_deadline.map_or(true, |armed| deadline < armed) {
                self.arm(&mut state, now, deadline);
            } else if released.iter().any(|r| r.was_root) && self.config.eager_rearm_on_cancel {
                self.rearm_for_root(&mut state, now);
            }
        }
        self.dispose(released);
    }

    fn cancel(&self, token: &TimerToken) {
        let raw = token.raw();
        if raw == 0 {
            return;
        }

        let released = {
            let mut state = self.lock();
            let released = state.table.cancel(raw);
            token.clear();

            if let Some(r) = &released {
                trace!(token = raw, "timer service: request cancelled");
                if r.was_root && self.config.eager_rearm_on_cancel && !state.shut_down {
                    let now = self.clock.now();
                    self.rearm_for_root(&mut state, now);
                }
            }
            released
        };
        self.dispose(released);
    }

    /// Disposes of released requests. Must be called without the state lock held.
    fn dispose(&self, released: impl IntoIterator<Item = Released>) {
        for r in released {
            if let Some(mut dispatch) = r.dispatch {
                self.dispatcher.cancel(&mut dispatch);
            }
            drop(r.callback);
        }
    }

    fn arm(&self, state: &mut State, now: Tick, deadline: Tick) {
        state.arm_generation += 1;
        state.armed_deadline = Some(deadline);
        let delay = ticks_to_duration(deadline.saturating_sub(now), self.config.tick);
        trace!(
            deadline,
            delay_us = delay.as_micros() as u64,
            generation = state.arm_generation,
            "timer service: arming one-shot timer"
        );
        self.timer.arm(delay, state.arm_generation);
    }

    fn disarm(&self, state: &mut State) {
        if state.armed_deadline.take().is_some() {
            state.arm_generation += 1;
            self.timer.disarm();
        }
    }

    /// Points the one-shot timer at the current earliest deadline, or disarms it if nothing is
    /// pending.
    fn rearm_for_root(&self, state: &mut State, now: Tick) {
        match state.table.next_deadline() {
            Some(deadline) if state.armed_deadline != Some(deadline) => {
                self.arm(state, now, deadline)
            }
            Some(_) => {}
            None => self.disarm(state),
        }
    }

    /// Runs on the one-shot timer's thread.
    fn on_timer_fire(self: &Arc<Self>, generation: u64) {
        let (due, now) = {
            let mut state = self.lock();
            let now = self.clock.now();
            if state.shut_down
                || state.armed_deadline.is_none()
                || generation != state.arm_generation
            {
                debug!(
                    generation,
                    current = state.arm_generation,
                    "timer service: ignoring stale timer fire"
                );
                return;
            }
            state.armed_deadline = None;

            let mut due = Vec::new();
            while let Some(d) = state.table.pop_due(now) {
                due.push(d);
            }
            if due.is_empty() {
                trace!(now, "timer service: timer fired before any deadline");
            }
            self.rearm_for_root(&mut state, now);
            (due, now)
        };

        if due.is_empty() {
            return;
        }
        trace!(count = due.len(), now, "timer service: dispatching due requests");

        let mut handed_off = Vec::with_capacity(due.len());
        for d in due {
            let (index, generation) = (d.index, d.generation);
            let callback = d.callback;
            let weak: Weak<Self> = Arc::downgrade(self);
            let mut dispatch = DispatchToken::new();
            self.dispatcher.queue(&mut dispatch, move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.lock().table.retire(index, generation) {
                    return;
                }
                if let Some(callback) = callback {
                    callback();
                }
            });
            handed_off.push((index, generation, dispatch));
        }

        // Requests cancelled between the hand-off and this point have already been released, so
        // their dispatcher entries are orphans.
        let orphaned: Vec<DispatchToken> = {
            let mut state = self.lock();
            handed_off
                .into_iter()
                .filter_map(|(index, generation, dispatch)| {
                    state.table.attach_dispatch(index, generation, dispatch).err()
                })
                .collect()
        };
        for mut dispatch in orphaned {
            self.dispatcher.cancel(&mut dispatch);
        }
    }

    fn shutdown(&self) {
        let released = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            self.disarm(&mut state);
            state.table.drain()
        };

        self.timer.shutdown();
        let dropped = released.len();
        self.dispose(released);
        debug!(dropped, "timer service shut down");
    }
}
