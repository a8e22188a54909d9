//! # Kernel synchronization primitives
//!
//! Spinning locks for code that must not sleep while holding them. The
//! allocator-facing pieces are [`SpinLock`], whose guard can be released
//! around a blocking call, and [`RwSpinLock`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod raw_spin;
mod rw_lock;
mod spin_lock;

pub use raw_spin::RawSpin;
pub use rw_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
