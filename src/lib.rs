//! Unidirectional synchronization bridge from Marathon to Consul.
//!
//! Marathon owns the truth about which tasks exist; the bridge mirrors it
//! into Consul as node-local service registrations and a label subtree in
//! the cluster KV store. Task events drive incremental updates, periodic
//! full syncs repair whatever events missed, and purge removes catalog
//! entries (identified by the bridge's ownership tags) whose tasks are
//! gone.

pub mod config;
pub mod consul;
pub mod errors;
pub mod events;
pub mod http;
pub mod marathon;
pub mod purge;
pub mod server;
pub mod sync;
pub mod tags;
