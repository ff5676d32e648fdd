//! Small shared types used across the crate: log identifiers, node ids, and the
//! `MessageSummary` trait used to keep trace spans readable.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a cluster member. Stable across restarts.
pub type NodeId = u64;

/// A `(term, index)` pair uniquely identifying a log entry's position.
///
/// Entries are compared first by `index` when deciding `>=`/`<=` ordering for the log
/// itself (indices are dense and monotone), but `term` is what decides whether two logs
/// agree at an index (§3 invariants).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// Identifies a snapshot instance when transferring it over the wire (§3).
///
/// Two snapshots taken at the same `last_log_id` may still differ in bytes, so this is a
/// random component appended to the log id rather than the log id alone.
pub type SnapshotId = String;

/// Identifies a single chunk boundary of a snapshot transfer, for mismatch diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

/// A trait for producing compact, human-readable summaries of RPC payloads for `tracing`
/// spans, so that `#[tracing::instrument(fields(rpc=%rpc.summary()))]` doesn't have to
/// print entire entry vectors.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Used by `RaftCore::report_metrics` to decide whether to recompute a derived field or
/// keep the last reported value.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
