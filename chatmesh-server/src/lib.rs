//! Peer-to-peer replication layer for a cluster of chat servers.
//!
//! Every node runs a [`mesh::PeerManager`] that links it to its peers over
//! newline-delimited JSON on plain TCP. Nodes exchange presence and database
//! snapshots on connect, replicate single mutations as they happen, and
//! forward user/channel messages with acknowledgment and bounded retry.

pub mod config;
pub mod db;
pub mod delivery;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod mesh;
pub mod metrics;
pub mod msgid;
pub mod node;
pub mod presence;
pub mod protocol;
pub mod redact;
pub mod replication;
pub mod snapshot;
pub mod sync;
