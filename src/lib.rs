//! # Warden
//!
//! A small lock service: one long-running process that accepts persistent
//! TCP connections and coordinates named reader/writer locks across them.
//! Clients acquire and release locks by name; the server grants, queues,
//! times out and revokes grants.
//!
//! All lock state lives in a single [`coordinator`] task. Connection
//! handlers, timers and disconnect events feed it typed messages over one
//! channel, so the reader/writer state machine in [`registry`] never needs
//! internal locking.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod wisdom;
