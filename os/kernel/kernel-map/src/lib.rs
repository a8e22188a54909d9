//! # Ordered maps keyed by 64-bit integers
//!
//! [`Map`] is a red-black tree whose nodes live in an index-linked arena.
//! It backs frame bookkeeping in the physical memory allocator and the
//! [`ReuseMappingDb`] mapping cache.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod cursor;
mod range;
mod rbtree;
pub mod reuse;
mod validate;

pub use cursor::{Cursor, Range};
pub use range::MemoryRange;
pub use rbtree::{Map, NodeId};
pub use reuse::{MappingBackend, ReuseError, ReuseMappingDb};
pub use validate::TreeViolation;
