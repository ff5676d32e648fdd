//! A Raft-based replicated state machine library with client sessions, segmented logs,
//! and snapshotting.
//!
//! The pieces, roughly bottom-up:
//! - [`log`] — the segmented, compactible, append-only replicated log (§4.1).
//! - [`meta`] — persistent hard state (`currentTerm`, `votedFor`, configuration) surviving restarts (§5).
//! - [`snapshot`] — the temporary → persisted → complete snapshot lifecycle (§4.2).
//! - [`cluster`] — the active cluster configuration and its joint-by-entry semantics (§4.3).
//! - [`session`] — client sessions: sequencing, dedup, and event delivery (§4.4).
//! - [`state_machine`] — the deterministic executor that drives an application [`StateMachine`](state_machine::StateMachine) (§4.5).
//! - [`core`] — the role state machine and the single-threaded primary dispatch context (§4.6).
//! - [`replication`] — the leader's per-follower append cycles and quorum commit (§4.7).
//! - [`network`] — the pluggable transport seam (§6).
//! - [`server`] — the public handle applications use to drive a node.
//! - [`client_api`] — an ergonomic, session-aware client built on top of [`server::Server`].

pub mod client_api;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod meta;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft_types;
pub mod replication;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod state_machine;

pub use config::Config;
pub use core::client::ClientWriteOk;
pub use core::client::ConsistencyLevel;
pub use core::Role;
pub use error::RaftError;
pub use error::RaftResult;
pub use network::RaftNetwork;
pub use raft_types::LogId;
pub use raft_types::MessageSummary;
pub use raft_types::NodeId;
pub use raft_types::SnapshotId;
pub use server::Server;
pub use state_machine::StateMachine;
