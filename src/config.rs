//! Replication runtime configuration.

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of entries per AppendEntries payload.
pub const DEFAULT_MAX_APPEND_ENTRIES: u64 = 300;
/// Default multiplier of the heartbeat interval after which an inactive
/// connection is re-established before the next send.
pub const DEFAULT_RECONNECT_LIMIT: u64 = 50;
/// Default multiplier of the heartbeat interval after which an in-flight send
/// is presumed lost and its exclusion token is forcibly released.
pub const DEFAULT_BUSY_FLAG_LIMIT: u64 = 10;
/// Default number of long-pause warnings emitted per episode before they are
/// suppressed.
pub const DEFAULT_WARNINGS_LIMIT: u32 = 20;
/// Default number of retries of an unacknowledged batch before it is shrunk
/// to a single entry.
pub const DEFAULT_STUCK_BATCH_RETRIES: u32 = 5;

/// The runtime configuration for the replication core.
///
/// The default values should work well for clusters running in multiple
/// datacenter availability zones with low latency between zones. These values
/// should typically be made configurable from the perspective of the
/// application which is being built on top of the core.
///
/// `heartbeat_interval` is the load-bearing value here: it is both the cadence
/// at which a leader's driver is expected to call
/// [`broadcast_append_entries`](crate::ReplicationCore::broadcast_append_entries)
/// and the unit in which all staleness thresholds are expressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster, for observability.
    pub cluster_name: String,
    /// The heartbeat interval in milliseconds at which leaders will send
    /// heartbeats to followers.
    ///
    /// **NOTE WELL:** it is very important that this value be greater than
    /// the amount of time it will take on average for an AppendEntries frame
    /// to be sent and acknowledged between nodes, as it also serves as the
    /// baseline for detecting stuck sends and stale connections.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per payload allowed to be transmitted
    /// during replication.
    ///
    /// Setting this value too low will primarily impact the speed at which
    /// slow nodes, nodes which have been offline, or nodes which are new to
    /// the cluster, are brought up-to-speed.
    pub max_append_entries: u64,
    /// A connection which has seen no activity for
    /// `heartbeat_interval * reconnect_limit` milliseconds is re-established
    /// before the next send.
    pub reconnect_limit: u64,
    /// An in-flight send which has not completed within
    /// `heartbeat_interval * busy_flag_limit` milliseconds is presumed lost;
    /// its exclusion token is forcibly released so that the next attempt can
    /// proceed.
    pub busy_flag_limit: u64,
    /// How many long-pause warnings are logged for a busy peer before the
    /// warning is suppressed until the peer recovers.
    pub warnings_limit: u32,
    /// How many times the same batch may be re-sent without acknowledgement
    /// before the batch size is reduced to a single entry.
    pub stuck_batch_retries: u32,
    /// Whether rolling the commit index backwards while overwriting
    /// conflicting entries should abort the process instead of logging a
    /// warning.
    pub fatal_on_commit_rollback: bool,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    /// Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            heartbeat_interval: None,
            max_append_entries: None,
            reconnect_limit: None,
            busy_flag_limit: None,
            warnings_limit: None,
            stuck_batch_retries: None,
            fatal_on_commit_rollback: None,
        }
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The interval at which leaders will send heartbeats to followers.
    pub heartbeat_interval: Option<u64>,
    /// The maximum number of entries per AppendEntries payload.
    pub max_append_entries: Option<u64>,
    /// The inactivity multiplier forcing reconnection.
    pub reconnect_limit: Option<u64>,
    /// The in-flight staleness multiplier forcing token release.
    pub busy_flag_limit: Option<u64>,
    /// The long-pause warning cap.
    pub warnings_limit: Option<u32>,
    /// The unacknowledged-batch retry cap.
    pub stuck_batch_retries: Option<u32>,
    /// The commit-rollback escalation toggle.
    pub fatal_on_commit_rollback: Option<bool>,
}

impl ConfigBuilder {
    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_append_entries`.
    pub fn max_append_entries(mut self, val: u64) -> Self {
        self.max_append_entries = Some(val);
        self
    }

    /// Set the desired value for `reconnect_limit`.
    pub fn reconnect_limit(mut self, val: u64) -> Self {
        self.reconnect_limit = Some(val);
        self
    }

    /// Set the desired value for `busy_flag_limit`.
    pub fn busy_flag_limit(mut self, val: u64) -> Self {
        self.busy_flag_limit = Some(val);
        self
    }

    /// Set the desired value for `warnings_limit`.
    pub fn warnings_limit(mut self, val: u32) -> Self {
        self.warnings_limit = Some(val);
        self
    }

    /// Set the desired value for `stuck_batch_retries`.
    pub fn stuck_batch_retries(mut self, val: u32) -> Self {
        self.stuck_batch_retries = Some(val);
        self
    }

    /// Set the desired value for `fatal_on_commit_rollback`.
    pub fn fatal_on_commit_rollback(mut self, val: bool) -> Self {
        self.fatal_on_commit_rollback = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance
    /// if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval == 0 {
            return Err(ConfigError::HeartbeatIntervalTooSmall);
        }
        let max_append_entries = self.max_append_entries.unwrap_or(DEFAULT_MAX_APPEND_ENTRIES);
        if max_append_entries == 0 {
            return Err(ConfigError::MaxAppendEntriesTooSmall);
        }
        let reconnect_limit = self.reconnect_limit.unwrap_or(DEFAULT_RECONNECT_LIMIT);
        if reconnect_limit == 0 {
            return Err(ConfigError::StalenessLimitTooSmall("reconnect_limit"));
        }
        let busy_flag_limit = self.busy_flag_limit.unwrap_or(DEFAULT_BUSY_FLAG_LIMIT);
        if busy_flag_limit == 0 {
            return Err(ConfigError::StalenessLimitTooSmall("busy_flag_limit"));
        }
        let warnings_limit = self.warnings_limit.unwrap_or(DEFAULT_WARNINGS_LIMIT);
        let stuck_batch_retries = self.stuck_batch_retries.unwrap_or(DEFAULT_STUCK_BATCH_RETRIES);
        let fatal_on_commit_rollback = self.fatal_on_commit_rollback.unwrap_or(false);
        Ok(Config {
            cluster_name: self.cluster_name,
            heartbeat_interval,
            max_append_entries,
            reconnect_limit,
            busy_flag_limit,
            warnings_limit,
            stuck_batch_retries,
            fatal_on_commit_rollback,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
