//! One-shot timer backends.
//!
//! The scheduler owns exactly one [`OneShotTimer`] and re-arms it for whatever deadline is
//! currently earliest. Every arm carries a generation number which is passed back to the fire
//! handler; the scheduler uses it to discard fires that were superseded by a later arm/disarm.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::TimerError;

/// Called on the timer's own thread with the generation passed to the matching
/// [`OneShotTimer::arm`].
pub type FireHandler = Box<dyn Fn(u64) + Send + Sync + 'static>;

pub trait OneShotTimer: Send + Sync {
    /// Installs the fire handler. Called once, before the first `arm`.
    fn start(&self, on_fire: FireHandler) -> Result<(), TimerError>;

    /// (Re)arms the timer to fire once after `delay`, replacing any previous arm.
    fn arm(&self, delay: Duration, generation: u64);

    fn disarm(&self);

    /// Stops the timer and waits for an in-progress fire handler to return.
    fn shutdown(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct ThreadTimerState {
    /// `(when, generation)`; `when` is `None` if the deadline is beyond what `Instant` can
    /// represent.
    armed: Option<(Option<Instant>, u64)>,
    shutdown: bool,
}

#[derive(Default)]
struct ThreadTimerShared {
    state: Mutex<ThreadTimerState>,
    cond: Condvar,
}

/// One-shot timer backed by a dedicated host thread sleeping on a condition variable.
#[derive(Default)]
pub struct ThreadTimer {
    shared: Arc<ThreadTimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(shared: &ThreadTimerShared, on_fire: FireHandler) {
        let mut state = lock(&shared.state);
        loop {
            if state.shutdown {
                break;
            }

            let armed = state.armed;
            match armed {
                None | Some((None, _)) => {
                    state = match shared.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some((Some(when), generation)) => {
                    let now = Instant::now();
                    if now >= when {
                        state.armed = None;
                        drop(state);
                        trace!(generation, "timer thread: firing");
                        on_fire(generation);
                        state = lock(&shared.state);
                    } else {
                        state = match shared.cond.wait_timeout(state, when - now) {
                            Ok((guard, _)) => guard,
                            Err(poisoned) => poisoned.into_inner().0,
                        };
                    }
                }
            }
        }
    }
}

impl OneShotTimer for ThreadTimer {
    fn start(&self, on_fire: FireHandler) -> Result<(), TimerError> {
        let mut slot = lock(&self.thread);
        if slot.is_some() {
            return Err(TimerError::AlreadyStarted);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("aero-timer".into())
            .spawn(move || Self::run(&shared, on_fire))?;
        *slot = Some(handle);
        Ok(())
    }

    fn arm(&self, delay: Duration, generation: u64) {
        let when = Instant::now().checked_add(delay);
        lock(&self.shared.state).armed = Some((when, generation));
        self.shared.cond.notify_one();
    }

    fn disarm(&self) {
        lock(&self.shared.state).armed = None;
        self.shared.cond.notify_one();
    }

    fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            state.armed = None;
        }
        self.shared.cond.notify_all();

        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Shut down from inside a fire handler; the loop exits once the handler returns.
            return;
        }
        if handle.join().is_err() {
            warn!("timer thread panicked");
        }
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct ManualTimerState {
    handler: Option<Arc<dyn Fn(u64) + Send + Sync + 'static>>,
    armed: Option<(Duration, u64)>,
    arm_count: u64,
    shut_down: bool,
}

/// Timer that only fires when told to, for deterministic tests.
///
/// Firing happens synchronously on the calling thread, which stands in for the OS timer thread.
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualTimerState>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay passed to the most recent `arm`, if the timer is still armed.
    pub fn armed_delay(&self) -> Option<Duration> {
        lock(&self.state).armed.map(|(delay, _)| delay)
    }

    pub fn armed_generation(&self) -> Option<u64> {
        lock(&self.state).armed.map(|(_, generation)| generation)
    }

    /// Total number of `arm` calls so far.
    pub fn arm_count(&self) -> u64 {
        lock(&self.state).arm_count
    }

    /// Fires the timer if it is armed. Returns whether it fired.
    pub fn fire(&self) -> bool {
        let (handler, generation) = {
            let mut state = lock(&self.state);
            let Some((_, generation)) = state.armed.take() else {
                return false;
            };
            let Some(handler) = state.handler.clone() else {
                return false;
            };
            (handler, generation)
        };
        handler(generation);
        true
    }

    /// Invokes the fire handler with an arbitrary generation, as a late OS callback would.
    pub fn fire_with_generation(&self, generation: u64) {
        let handler = lock(&self.state).handler.clone();
        if let Some(handler) = handler {
            handler(generation);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }
}

impl OneShotTimer for ManualTimer {
    fn start(&self, on_fire: FireHandler) -> Result<(), TimerError> {
        let mut state = lock(&self.state);
        if state.handler.is_some() {
            return Err(TimerError::AlreadyStarted);
        }
        state.handler = Some(Arc::from(on_fire));
        Ok(())
    }

    fn arm(&self, delay: Duration, generation: u64) {
        let mut state = lock(&self.state);
        state.armed = Some((delay, generation));
        state.arm_count += 1;
    }

    fn disarm(&self) {
        lock(&self.state).armed = None;
    }

    fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.shut_down = true;
        state.armed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    #[test]
    fn thread_timer_fires_once_with_the_armed_generation() {
        let timer = ThreadTimer::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        timer
            .start(Box::new(move |generation| {
                let _ = tx.lock().unwrap().send(generation);
            }))
            .unwrap();

        timer.arm(Duration::from_millis(5), 7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(7));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        timer.shutdown();
    }

    #[test]
    fn thread_timer_rearm_replaces_previous_deadline() {
        let timer = ThreadTimer::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        timer
            .start(Box::new(move |generation| {
                let _ = tx.lock().unwrap().send(generation);
            }))
            .unwrap();

        timer.arm(Duration::from_secs(30), 1);
        timer.arm(Duration::from_millis(1), 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
        timer.shutdown();
    }

    #[test]
    fn thread_timer_disarm_prevents_fire() {
        let timer = ThreadTimer::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        timer
            .start(Box::new(move |generation| {
                let _ = tx.lock().unwrap().send(generation);
            }))
            .unwrap();

        timer.arm(Duration::from_millis(20), 1);
        timer.disarm();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timer.shutdown();
    }

    #[test]
    fn start_twice_is_rejected() {
        let timer = ThreadTimer::new();
        timer.start(Box::new(|_| {})).unwrap();
        assert!(matches!(
            timer.start(Box::new(|_| {})),
            Err(TimerError::AlreadyStarted)
        ));

        let manual = ManualTimer::new();
        manual.start(Box::new(|_| {})).unwrap();
        assert!(matches!(
            manual.start(Box::new(|_| {})),
            Err(TimerError::AlreadyStarted)
        ));
    }

    #[test]
    fn manual_timer_fires_only_when_armed() {
        let timer = ManualTimer::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        timer
            .start(Box::new(move |generation| f.lock().unwrap().push(generation)))
            .unwrap();

        assert!(!timer.fire());
        timer.arm(Duration::from_millis(3), 4);
        assert_eq!(timer.armed_delay(), Some(Duration::from_millis(3)));
        assert!(timer.fire());
        assert!(!timer.fire());
        timer.fire_with_generation(1);
        assert_eq!(*fired.lock().unwrap(), vec![4, 1]);
        assert_eq!(timer.arm_count(), 1);
    }
}
