use std::collections::VecDeque;
use std::fmt;

use tracing::trace;

use crate::sync::{Mutex, MutexGuard};
use crate::token::{DispatchToken, TokenCell};

/// A deferred, type-erased unit of work. Runs at most once and is dropped without running if
/// cancelled.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Hook invoked when the queue transitions from empty to non-empty.
pub type WakeHook = std::sync::Arc<dyn Fn() + Send + Sync + 'static>;

/// Token of the first entry ever queued. Tokens are always odd so that `0` (and any even value)
/// can never name a live entry.
const FIRST_TOKEN: u64 = 1;
const TOKEN_STRIDE: u64 = 2;

struct QueueEntry {
    /// `None` once the entry has been cancelled; the hole stays in place so that the offsets of
    /// later entries do not move.
    callback: Option<Callback>,
    token: Option<TokenCell>,
}

struct Inner {
    entries: VecDeque<QueueEntry>,
    /// Token of `entries[0]`.
    head_token: u64,
    wake: Option<WakeHook>,
}

impl Inner {
    fn next_token(&self) -> u64 {
        self.head_token + TOKEN_STRIDE * self.entries.len() as u64
    }

    fn position(&self, token: u64) -> Option<usize> {
        if token & 1 == 0 {
            return None;
        }
        let offset = token.checked_sub(self.head_token)? / TOKEN_STRIDE;
        let offset = usize::try_from(offset).ok()?;
        (offset < self.entries.len()).then_some(offset)
    }

    /// Removes the callback of a still-queued entry, leaving a tombstone behind.
    fn take(&mut self, token: u64) -> Option<Callback> {
        let pos = self.position(token)?;
        let entry = &mut self.entries[pos];
        if let Some(cell) = entry.token.take() {
            cell.clear_if(token);
        }
        entry.callback.take()
    }
}

/// Multi-producer, single-consumer FIFO of deferred callbacks.
///
/// Any thread may [`queue`](Self::queue), [`post`](Self::post) or [`cancel`](Self::cancel).
/// Exactly one thread, the owner, calls [`run_callbacks`](Self::run_callbacks). No callback, wake
/// hook or callback destructor ever runs while the internal lock is held, so all of them may
/// call back into the dispatcher.
pub struct AsyncDispatcher {
    inner: Mutex<Inner>,
}

impl Default for AsyncDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                head_token: FIRST_TOKEN,
                wake: None,
            }),
        }
    }

    pub fn with_wake_callback<F>(wake: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let dispatcher = Self::new();
        dispatcher.set_wake_callback(wake);
        dispatcher
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replaces the hook invoked on every empty → non-empty transition.
    pub fn set_wake_callback<F>(&self, wake: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().wake = Some(std::sync::Arc::new(wake));
    }

    /// Appends `callback` and stores its token in `token`.
    ///
    /// Whatever `token` referred to before is cancelled first, so a single token tracks at most
    /// one pending callback.
    pub fn queue<F>(&self, token: &mut DispatchToken, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Some(token), Box::new(callback));
    }

    /// Appends `callback` without a way to cancel it.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(None, Box::new(callback));
    }

    fn push(&self, token: Option<&DispatchToken>, callback: Callback) {
        let replaced;
        let wake;
        {
            let mut inner = self.lock();
            replaced = token.and_then(|t| inner.take(t.raw()));

            let was_empty = inner.entries.is_empty();
            let issued = inner.next_token();
            let cell = token.map(|t| {
                t.set(issued);
                t.share()
            });
            inner.entries.push_back(QueueEntry {
                callback: Some(callback),
                token: cell,
            });

            wake = if was_empty { inner.wake.clone() } else { None };
        }

        drop(replaced);

        if let Some(wake) = wake {
            trace!("async dispatcher: queue became non-empty, waking owner");
            wake();
        }
    }

    /// Cancels the callback referred to by `token` and resets `token` to `0`.
    ///
    /// Zero, stale and already-run tokens are ignored.
    pub fn cancel(&self, token: &mut DispatchToken) {
        let raw = token.raw();
        if raw == 0 {
            return;
        }

        let cancelled = {
            let mut inner = self.lock();
            let callback = inner.take(raw);
            token.clear();
            callback
        };

        drop(cancelled);
    }

    /// Runs queued callbacks in FIFO order until the queue is empty, returning how many actually
    /// executed (cancelled entries are skipped).
    ///
    /// The count is of queue entries invoked. A callback that decides at run time to do nothing,
    /// such as a timer hand-off whose request was cancelled after it was queued, still counts.
    ///
    /// Must only be called from the owning thread. The lock is taken once per entry, so
    /// cancellation of later entries keeps working while earlier callbacks run, and callbacks
    /// queued from inside a callback run in the same pass.
    pub fn run_callbacks(&self) -> usize {
        let mut executed = 0;
        loop {
            let callback = {
                let mut inner = self.lock();
                let Some(entry) = inner.entries.pop_front() else {
                    break;
                };
                let issued = inner.head_token;
                inner.head_token += TOKEN_STRIDE;
                if let Some(cell) = entry.token {
                    cell.clear_if(issued);
                }
                entry.callback
            };

            if let Some(callback) = callback {
                callback();
                executed += 1;
            }
        }
        executed
    }

    /// Number of queued entries, including cancelled ones that have not been reached yet.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl fmt::Debug for AsyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AsyncDispatcher")
            .field("len", &inner.entries.len())
            .field("head_token", &inner.head_token)
            .field("has_wake", &inner.wake.is_some())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |id: u32| -> Callback {
            let log = Arc::clone(&log2);
            Box::new(move || log.lock().unwrap().push(id))
        };
        (log, make)
    }

    fn counting_wake(dispatcher: &AsyncDispatcher) -> Arc<AtomicUsize> {
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&wakes);
        dispatcher.set_wake_callback(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });
        wakes
    }

    #[test]
    fn callbacks_run_in_queue_order() {
        let d = AsyncDispatcher::new();
        let (log, cb) = recorder();
        let mut tokens: Vec<DispatchToken> = (0..5).map(|_| DispatchToken::new()).collect();
        for (i, t) in tokens.iter_mut().enumerate() {
            d.queue(t, cb(i as u32));
        }

        assert_eq!(d.run_callbacks(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(d.is_empty());
    }

    #[test]
    fn cancelled_entry_is_skipped_in_the_same_pass() {
        let d = AsyncDispatcher::new();
        let (log, cb) = recorder();
        let mut t1 = DispatchToken::new();
        let mut t2 = DispatchToken::new();
        d.queue(&mut t1, cb(1));
        d.queue(&mut t2, cb(2));

        d.cancel(&mut t1);
        assert_eq!(t1.raw(), 0);
        assert_eq!(d.len(), 2, "cancellation leaves a hole instead of shifting");

        assert_eq!(d.run_callbacks(), 1);
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn tokens_are_odd_and_spaced_by_queue_position() {
        let d = AsyncDispatcher::new();
        let mut a = DispatchToken::new();
        let mut b = DispatchToken::new();
        let mut c = DispatchToken::new();
        d.queue(&mut a, || {});
        d.queue(&mut b, || {});
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 3);

        d.run_callbacks();
        d.queue(&mut c, || {});
        assert_eq!(c.raw(), 5, "head advanced by two per popped entry");
    }

    #[test]
    fn token_is_reset_once_the_callback_is_popped() {
        let d = AsyncDispatcher::new();
        let mut t = DispatchToken::new();
        d.queue(&mut t, || {});
        assert!(t.is_pending());
        d.run_callbacks();
        assert!(!t.is_pending());
    }

    #[test]
    fn cancel_of_zero_even_or_stale_token_is_a_noop() {
        let d = AsyncDispatcher::new();
        let (log, cb) = recorder();
        let mut live = DispatchToken::new();
        d.queue(&mut live, cb(7));

        d.cancel(&mut DispatchToken::new());
        d.cancel(&mut DispatchToken::from_raw(2));
        d.cancel(&mut DispatchToken::from_raw(live.raw() + 2));

        let mut done = DispatchToken::new();
        d.queue(&mut done, cb(8));
        let stale = done.raw();
        // Second run with `done` popped; its value must not alias later entries.
        d.run_callbacks();
        d.queue(&mut live, cb(9));
        d.cancel(&mut DispatchToken::from_raw(stale));

        d.run_callbacks();
        assert_eq!(*log.lock().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn double_cancel_is_harmless() {
        let d = AsyncDispatcher::new();
        let (log, cb) = recorder();
        let mut t = DispatchToken::new();
        let mut other = DispatchToken::new();
        d.queue(&mut t, cb(1));
        d.queue(&mut other, cb(2));

        let copy = t.raw();
        d.cancel(&mut t);
        d.cancel(&mut t);
        d.cancel(&mut DispatchToken::from_raw(copy));

        assert_eq!(d.run_callbacks(), 1);
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn cancel_through_a_copy_resets_the_owning_token() {
        let d = AsyncDispatcher::new();
        let (log, cb) = recorder();
        let mut owner = DispatchToken::new();
        d.queue(&mut owner, cb(1));

        d.cancel(&mut DispatchToken::from_raw(owner.raw()));
        assert!(!owner.is_pending());

        assert_eq!(d.run_callbacks(), 0);
        assert_eq!(owner.raw(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn queue_replaces_previous_entry_for_the_same_token() {
        let d = AsyncDispatcher::new();
        let (log, cb) = recorder();
        let mut t = DispatchToken::new();
        d.queue(&mut t, cb(1));
        d.queue(&mut t, cb(2));

        assert_eq!(d.run_callbacks(), 1);
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert!(!t.is_pending());
    }

    #[test]
    fn cancelled_callback_is_dropped_immediately() {
        let d = AsyncDispatcher::new();
        let held = Arc::new(());
        let captured = Arc::clone(&held);
        let mut t = DispatchToken::new();
        d.queue(&mut t, move || drop(captured));
        assert_eq!(Arc::strong_count(&held), 2);

        d.cancel(&mut t);
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn wake_fires_once_per_empty_to_non_empty_transition() {
        let d = AsyncDispatcher::new();
        let wakes = counting_wake(&d);

        d.post(|| {});
        d.post(|| {});
        d.post(|| {});
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        d.run_callbacks();
        d.post(|| {});
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tombstones_keep_the_queue_non_empty() {
        let d = AsyncDispatcher::new();
        let wakes = counting_wake(&d);
        let mut t = DispatchToken::new();
        d.queue(&mut t, || {});
        d.cancel(&mut t);

        d.post(|| {});
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wake_hook_may_reenter_the_dispatcher() {
        let d = Arc::new(AsyncDispatcher::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let (weak, s) = (Arc::downgrade(&d), Arc::clone(&seen));
        d.set_wake_callback(move || {
            if let Some(d) = weak.upgrade() {
                s.store(d.len(), Ordering::SeqCst);
            }
        });

        d.post(|| {});
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_queue_more_work_while_draining() {
        let d = Arc::new(AsyncDispatcher::new());
        let (log, cb) = recorder();
        let follow_up = Arc::new(Mutex::new(DispatchToken::new()));

        let inner_d = Arc::clone(&d);
        let inner_cb = cb(3);
        let slot = Arc::clone(&follow_up);
        let log_a = Arc::clone(&log);
        d.post(move || {
            log_a.lock().unwrap().push(1);
            let mut t3 = slot.lock().unwrap();
            inner_d.queue(&mut t3, inner_cb);
        });

        assert_eq!(d.run_callbacks(), 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
        assert!(!follow_up.lock().unwrap().is_pending());
    }

    #[test]
    fn callback_can_cancel_a_later_entry() {
        let d = Arc::new(AsyncDispatcher::new());
        let (log, cb) = recorder();
        let victim = Arc::new(Mutex::new(DispatchToken::new()));

        let inner_d = Arc::clone(&d);
        let v = Arc::clone(&victim);
        d.post(move || inner_d.cancel(&mut v.lock().unwrap()));
        d.queue(&mut victim.lock().unwrap(), cb(2));
        d.post(cb(3));

        assert_eq!(d.run_callbacks(), 2);
        assert_eq!(*log.lock().unwrap(), vec![3]);
    }

    #[test]
    fn concurrent_producers_all_get_run() {
        let d = Arc::new(AsyncDispatcher::new());
        let wakes = counting_wake(&d);
        let ran = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let d = Arc::clone(&d);
            let ran = Arc::clone(&ran);
            threads.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    let ran = Arc::clone(&ran);
                    d.post(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for th in threads {
            th.join().expect("thread join");
        }

        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert_eq!(d.run_callbacks(), 1000);
        assert_eq!(ran.load(Ordering::SeqCst), 1000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Queue(usize),
        Cancel(usize),
        Run,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..8).prop_map(Op::Queue),
            2 => (0usize..8).prop_map(Op::Cancel),
            1 => Just(Op::Run),
        ]
    }

    proptest! {
        // Eight caller-owned tokens are reused at random; the dispatcher must behave like a plain
        // FIFO where each token owns at most one live entry.
        #[test]
        fn matches_fifo_model(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let d = AsyncDispatcher::new();
            let (log, cb) = recorder();
            let mut tokens: Vec<DispatchToken> = (0..8).map(|_| DispatchToken::new()).collect();
            // Model: (token slot, callback id) of live entries, in FIFO order.
            let mut model: Vec<(usize, u32)> = Vec::new();
            let mut expected: Vec<u32> = Vec::new();
            let mut next_id = 0u32;

            for op in ops {
                match op {
                    Op::Queue(slot) => {
                        model.retain(|&(s, _)| s != slot);
                        d.queue(&mut tokens[slot], cb(next_id));
                        model.push((slot, next_id));
                        next_id += 1;
                    }
                    Op::Cancel(slot) => {
                        model.retain(|&(s, _)| s != slot);
                        d.cancel(&mut tokens[slot]);
                        prop_assert_eq!(tokens[slot].raw(), 0);
                    }
                    Op::Run => {
                        let ran = d.run_callbacks();
                        prop_assert_eq!(ran, model.len());
                        expected.extend(model.drain(..).map(|(_, id)| id));
                        prop_assert!(tokens.iter().all(|t| !t.is_pending()));
                    }
                }
            }

            d.run_callbacks();
            expected.extend(model.drain(..).map(|(_, id)| id));
            prop_assert_eq!(&*log.lock().unwrap(), &expected);
        }
    }
}
