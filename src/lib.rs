//! # raft-replication
//!
//! The log replication core of a Raft consensus server.
//!
//! This crate implements the two hardest flows of Raft's §5.3: the leader-side
//! AppendEntries dispatcher and the follower-side acceptance & commit
//! machinery, together with the per-peer tracking state they share. Elections,
//! persistence, snapshot transfer and the network transport are consumed
//! through traits ([`LogStore`], [`StateMachine`], [`ReplicationNetwork`],
//! [`EventHandler`]) so that any substrate satisfying their contracts can host
//! the core.
//!
//! The central type is [`ReplicationCore`]. A transport feeds inbound frames
//! to [`ReplicationCore::handle_append_entries`]; a leader's heartbeat driver
//! calls [`ReplicationCore::broadcast_append_entries`]; responses flow back in
//! through the dispatch tasks the core spawns itself.

pub mod config;
mod core;
pub mod error;
pub mod event;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod raft_types;
mod replication;
pub mod state_machine;
pub mod storage;
pub mod summary;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::PeerStats;
pub use crate::core::ReplicationCore;
pub use crate::core::Role;
pub use crate::error::ConfigError;
pub use crate::error::RaftResult;
pub use crate::error::ReplicationError;
pub use crate::event::CallbackAction;
pub use crate::event::EventContext;
pub use crate::event::EventHandler;
pub use crate::event::RaftEvent;
pub use crate::network::ReplicationNetwork;
pub use crate::raft_types::LogId;
pub use crate::raft_types::SnapshotMeta;
pub use crate::replication::PeerConfig;
pub use crate::state_machine::StateMachine;
pub use crate::storage::LogStore;
pub use crate::summary::MessageSummary;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific log data.
///
/// The intention of this trait is that applications which are using this crate
/// will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// goes through Raft. The payload is carried opaquely by the replication flows
/// and handed back to the application's [`StateMachine`] and [`LogStore`]
/// implementations as-is.
pub trait AppData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
