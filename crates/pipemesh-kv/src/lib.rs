//! Consistent KV client.
//!
//! A thin layer over a replicated, linearizable key/value store:
//! - [`KvStore`]: the raw transport (get, versioned CAS put, blocking prefix
//!   list, delete), implemented for Consul over HTTP and, with the
//!   `test-utils` feature, in memory
//! - [`ConsistentClient`]: JSON values, retrying compare-and-swap with a
//!   callback, long-poll prefix watch, and conditional prefix delete

pub mod client;
pub mod consul;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod store;

pub use client::{ConsistentClient, Swapped};
pub use consul::ConsulKv;
pub use error::{CasAbort, CasError, KvError};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryKv;
pub use store::{KvList, KvPair, KvStore};
