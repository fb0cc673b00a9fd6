//! floe-sink — periodic, crash-safe export of observed client addresses.
//!
//! Addresses are collected into keyed probabilistic sets (one per named
//! sink) and flushed on a timer as JSON-framed entries to durable writers.
//! The sets are bounded-size digests, so the log leaks counts rather than
//! addresses.

mod cluster;
mod ipset;

pub use cluster::{ClusterWriter, SinkEntry, WriteSyncer};
pub use ipset::IpSetSink;
