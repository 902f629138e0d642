//! # warden-session
//!
//! Connection lifecycle management for a ZooKeeper-style coordination
//! session: one logical session at a time, replaced as the connection churns,
//! with a deadline-bounded "wait for a usable session" and a replaying status
//! broadcast.
//!
//! - [`ConnectionManager`] owns the snapshot chain and reconnection policy
//! - [`Client`] runs typed coordination operations on top of it
//! - [`MemoryEnsemble`] is an in-process collaborator for tests and simulation

#![deny(unsafe_code)]

pub mod backoff;
pub mod broadcast;
pub mod client;
pub mod handle;
pub mod manager;
pub mod memory;
pub mod snapshot;
pub mod watches;

pub use backoff::{Backoff, BackoffConfig};
pub use broadcast::{Broadcaster, StatusObserver, StatusStream, Subscription};
pub use client::{Client, ClientConfig};
pub use handle::{EventSink, SessionFactory, SessionHandle, Watcher};
pub use manager::{
    AddressProvider, ConnectionManager, ManagerBuilder, ManagerConfig, StaticAddresses,
};
pub use memory::{MemoryEnsemble, MemorySession};
pub use snapshot::{Snapshot, Successor};
pub use watches::{WatchCache, WatchRegistration};
