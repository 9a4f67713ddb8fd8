//! Synchronization primitives, swapped for Loom's model-checked versions under
//! `--features loom` tests.

#[cfg(all(feature = "loom", test))]
pub(crate) use loom::sync::{atomic::AtomicU64, Arc, Mutex, MutexGuard};
#[cfg(not(all(feature = "loom", test)))]
pub(crate) use std::sync::{atomic::AtomicU64, Arc, Mutex, MutexGuard};

pub(crate) use std::sync::atomic::Ordering;
