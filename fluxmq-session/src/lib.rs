//! # FluxMQ Session
//!
//! Session coordination core for FluxMQ and Kafka consumers.
//!
//! A [`Session`] keeps cluster topology, finds and caches the coordinator
//! of its consumer group, drives join/sync/heartbeat, fetches and commits
//! offsets, reads partitions and streams records into a channel. All of it
//! runs inside one actor task, so requests reach brokers strictly one at a
//! time and correlation ids grow by one per round trip.
//!
//! ## Features
//!
//! - **Single Actor**: one tokio task owns all session state
//! - **Leader Cache**: partition leaders resolved once, refreshed on demand
//! - **Coordinator Discovery**: bounded retry with fixed backoff
//! - **Group Membership**: join, sync, heartbeat and leave round trips
//! - **Offsets**: fetch fails closed, commit falls back to the bootstrap broker
//! - **Streaming**: self-rescheduling poller publishing to an mpsc sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxmq_session::*;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SessionConfigBuilder::new()
//!         .brokers(vec!["localhost:9092"])
//!         .consumer_group("my-consumer-group")
//!         .build();
//!     let session = Session::start(config)?;
//!
//!     let committed = session
//!         .offset_fetch(OffsetFetchRequest::new("my-topic", 0))
//!         .await?
//!         .completed()
//!         .and_then(|r| r.offset("my-topic", 0))
//!         .unwrap_or(-1);
//!
//!     let (sink, mut records) = mpsc::unbounded_channel();
//!     let cursor = FetchCursor::new("my-topic", 0, committed + 1).with_auto_commit(true);
//!     session.start_streaming(cursor, sink)?;
//!
//!     while let Some(record) = records.recv().await {
//!         println!("offset={} value={:?}", record.offset, record.value);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod offsets;
pub mod poller;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod testing;

pub use cluster::{BrokerId, ClusterMetadata};
pub use codec::{Codec, KafkaCodec};
pub use crate::config::*;
pub use connection::{Connection, Connector, TcpConnection, TcpConnector};
pub use coordinator::ConsumerGroupMetadata;
pub use crate::error::*;
pub use fetch::FetchCursor;
pub use poller::{RecordSink, StreamId};
pub use protocol::{
    ConsumeRecord, FetchResponse, HeartbeatResponse, JoinGroupResponse, LeaveGroupResponse,
    MemberAssignment, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, SyncGroupResponse, TopicAssignment, TopicPartition,
};
pub use session::{Outcome, Session};

/// Session library result type
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
