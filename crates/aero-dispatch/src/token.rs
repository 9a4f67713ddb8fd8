use std::fmt;

use crate::sync::{Arc, AtomicU64, Ordering};

/// Caller-owned cancellation storage for a queued callback.
///
/// `0` means "nothing queued". The dispatcher keeps a handle to the same storage and resets it to
/// `0` when the callback is popped for execution or cancelled, so callers can check
/// [`DispatchToken::is_pending`] without tracking the callback's fate themselves.
pub struct DispatchToken {
    cell: Arc<AtomicU64>,
}

impl DispatchToken {
    pub fn new() -> Self {
        Self::from_raw(0)
    }

    /// Creates detached storage holding `raw`.
    ///
    /// The result shares nothing with the token `raw` was read from; cancelling through it is
    /// only effective while `raw` still names a pending entry.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            cell: Arc::new(AtomicU64::new(raw)),
        }
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.cell.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.raw() != 0
    }

    pub(crate) fn set(&self, raw: u64) {
        self.cell.store(raw, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.set(0);
    }

    pub(crate) fn share(&self) -> TokenCell {
        TokenCell(Arc::clone(&self.cell))
    }
}

impl Default for DispatchToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DispatchToken").field(&self.raw()).finish()
    }
}

/// The dispatcher's handle on a caller's [`DispatchToken`] storage.
pub(crate) struct TokenCell(Arc<AtomicU64>);

impl TokenCell {
    /// Resets the caller's storage, unless it has since been reused for another entry.
    pub(crate) fn clear_if(&self, raw: u64) {
        let _ = self
            .0
            .compare_exchange(raw, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}
