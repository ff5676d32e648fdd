//! Runtime configuration for a server (§6).

use rand::thread_rng;
use rand::Rng;

/// How the log and snapshot store should hold their data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageLevel {
    /// Entries live only in process memory; nothing survives a restart. Useful for tests.
    Memory,
    /// Entries are written through a memory-mapped file region.
    Mapped,
    /// Entries are written with ordinary buffered file I/O and explicit flush/fsync.
    Disk,
}

impl Default for StorageLevel {
    fn default() -> Self {
        StorageLevel::Disk
    }
}

/// The policy which determines when a log compaction (snapshot) job is triggered.
#[derive(Clone, Debug)]
pub enum SnapshotPolicy {
    /// Snapshot once the applied index has advanced this many entries past the last snapshot.
    LogsSinceLast(u64),
    /// Snapshot on a wall-clock-independent cadence measured against the executor's
    /// deterministic clock (§4.5 `SNAPSHOT_INTERVAL_MS`).
    TimeSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::TimeSinceLast(SNAPSHOT_INTERVAL_MS)
    }
}

/// Default snapshot cadence, per §4.5.
pub const SNAPSHOT_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Errors which can occur when validating a `Config`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min must be less than election_timeout_max")]
    ElectionTimeoutMinMax,
    #[error("election_timeout_min must be greater than heartbeat_interval")]
    ElectionTimeoutLessThanHeartBeatInterval,
    #[error("session_timeout must be greater than election_timeout_max")]
    SessionTimeoutTooShort,
    #[error("max_payload_entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}

/// Runtime config for a Raft server.
///
/// Validate with [`Config::build`] rather than constructing directly, so that the
/// invariants relating the timing knobs together (`heartbeat_interval < electionTimeout <
/// sessionTimeout`) are always upheld.
#[derive(Clone, Debug)]
pub struct Config {
    /// A name for the cluster, included in trace spans.
    pub cluster_name: String,
    /// Lower bound (ms) of the randomized election timeout window (default 750, per §6).
    pub election_timeout_min: u64,
    /// Upper bound (ms) of the randomized election timeout window.
    pub election_timeout_max: u64,
    /// Leader append cadence to idle followers (ms, default 250).
    pub heartbeat_interval: u64,
    /// Idle interval (ms) after which a session is expired at apply time (default 5000).
    pub session_timeout: u64,
    /// After this much partition time (ms), a follower's log is truncated to the leader's on heal
    /// (default 1 hour).
    pub global_suspend_timeout: u64,
    /// Max number of entries batched into a single AppendEntries/replication payload.
    pub max_payload_entries: u64,
    /// Bound a segment by entry count.
    pub max_entries_per_segment: u64,
    /// Bound a segment by byte size.
    pub max_segment_size: u64,
    /// How far behind (in log indices) a replication target may lag before being
    /// downgraded from line-rate to lagging replication.
    pub replication_lag_threshold: u64,
    /// Timeout (ms) for a single InstallSnapshot chunk round-trip.
    pub install_snapshot_timeout: u64,
    /// Max bytes sent per InstallSnapshot chunk.
    pub snapshot_max_chunk_size: u64,
    /// When to trigger a new snapshot / compaction.
    pub snapshot_policy: SnapshotPolicy,
    /// How the log and snapshot files are stored on disk.
    pub storage_level: StorageLevel,
    /// Consecutive replication failures past the election timeout before a member is
    /// marked UNAVAILABLE (§4.7).
    pub max_append_failures: u32,
}

impl Config {
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            session_timeout: None,
            global_suspend_timeout: None,
            max_payload_entries: None,
            max_entries_per_segment: None,
            max_segment_size: None,
            replication_lag_threshold: None,
            install_snapshot_timeout: None,
            snapshot_max_chunk_size: None,
            snapshot_policy: None,
            storage_level: None,
            max_append_failures: None,
        }
    }

    /// Generate a new random election timeout within the configured window.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A builder for `Config`, enforcing the relationships between timing knobs described in §6.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    session_timeout: Option<u64>,
    global_suspend_timeout: Option<u64>,
    max_payload_entries: Option<u64>,
    max_entries_per_segment: Option<u64>,
    max_segment_size: Option<u64>,
    replication_lag_threshold: Option<u64>,
    install_snapshot_timeout: Option<u64>,
    snapshot_max_chunk_size: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    storage_level: Option<StorageLevel>,
    max_append_failures: Option<u32>,
}

macro_rules! builder_field {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, v: $ty) -> Self {
            self.$name = Some(v);
            self
        }
    };
}

impl ConfigBuilder {
    builder_field!(election_timeout_min, u64);
    builder_field!(election_timeout_max, u64);
    builder_field!(heartbeat_interval, u64);
    builder_field!(session_timeout, u64);
    builder_field!(global_suspend_timeout, u64);
    builder_field!(max_payload_entries, u64);
    builder_field!(max_entries_per_segment, u64);
    builder_field!(max_segment_size, u64);
    builder_field!(replication_lag_threshold, u64);
    builder_field!(install_snapshot_timeout, u64);
    builder_field!(snapshot_max_chunk_size, u64);
    builder_field!(storage_level, StorageLevel);
    builder_field!(max_append_failures, u32);

    pub fn snapshot_policy(mut self, v: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(v);
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(750);
        let election_timeout_max = self.election_timeout_max.unwrap_or(1500);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(250);
        let session_timeout = self.session_timeout.unwrap_or(5000);

        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::ElectionTimeoutMinMax);
        }
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::ElectionTimeoutLessThanHeartBeatInterval);
        }
        if session_timeout <= election_timeout_max {
            return Err(ConfigError::SessionTimeoutTooShort);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(300);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            session_timeout,
            global_suspend_timeout: self.global_suspend_timeout.unwrap_or(60 * 60 * 1000),
            max_payload_entries,
            max_entries_per_segment: self.max_entries_per_segment.unwrap_or(1 << 20),
            max_segment_size: self.max_segment_size.unwrap_or(1 << 29),
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(200),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(1024 * 1024 * 3),
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            storage_level: self.storage_level.unwrap_or_default(),
            max_append_failures: self.max_append_failures.unwrap_or(3),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::build("test").validate().unwrap();
        assert!(cfg.heartbeat_interval < cfg.election_timeout_min);
        assert!(cfg.election_timeout_max < cfg.session_timeout);
    }

    #[test]
    fn rejects_backwards_election_window() {
        let err = Config::build("test")
            .election_timeout_min(1000)
            .election_timeout_max(500)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ElectionTimeoutMinMax));
    }

    #[test]
    fn rejects_session_timeout_too_short() {
        let err = Config::build("test").session_timeout(100).validate().unwrap_err();
        assert!(matches!(err, ConfigError::SessionTimeoutTooShort));
    }
}
