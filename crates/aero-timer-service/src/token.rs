use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Caller-owned storage for a pending timer request.
///
/// `0` means "not armed". The service keeps a handle to the same storage and resets it to `0`
/// when the request is cancelled or its callback is about to run.
pub struct TimerToken {
    cell: Arc<AtomicU64>,
}

impl TimerToken {
    pub fn new() -> Self {
        Self::from_raw(0)
    }

    /// Creates detached storage holding `raw`, e.g. a value copied out of another token.
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
    pub fn is_armed(&self) -> bool {
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

impl Default for TimerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TimerToken")
            .field(&format_args!("{:#x}", self.raw()))
            .finish()
    }
}

pub(crate) struct TokenCell(Arc<AtomicU64>);

impl TokenCell {
    /// Resets the caller's storage unless it has since been reused for another request.
    pub(crate) fn clear_if(&self, raw: u64) {
        let _ = self
            .0
            .compare_exchange(raw, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Packs a slot index and its generation. The index is stored off by one so that no live token
/// is ever `0`.
pub(crate) fn encode(index: u32, generation: u32) -> u64 {
    (u64::from(generation) << 32) | (u64::from(index) + 1)
}

pub(crate) fn decode(raw: u64) -> Option<(u32, u32)> {
    let index = (raw as u32).checked_sub(1)?;
    Some((index, (raw >> 32) as u32))
}
