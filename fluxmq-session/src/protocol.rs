//! Typed requests and responses exchanged with brokers
//!
//! These are the values the session core works with; [`crate::codec`] turns
//! them into Kafka wire frames and back.

use bytes::Bytes;

use crate::error::{ErrorCode, SessionError};

pub type TopicName = String;
pub type PartitionId = i32;
pub type Offset = i64;
pub type CorrelationId = i32;
pub type NodeId = i32;

/// Kafka API keys spoken by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Fetch = 1,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    ConsumerMetadata = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
}

impl ApiKey {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Request version used on the wire for this API
    pub fn api_version(self) -> i16 {
        match self {
            ApiKey::OffsetFetch => 1,
            ApiKey::OffsetCommit => 2,
            _ => 0,
        }
    }
}

/// Topic partition identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new<T: Into<TopicName>>(topic: T, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Metadata request; an empty topic list asks for every topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRequest {
    pub topics: Vec<TopicName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub node_id: NodeId,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub error_code: ErrorCode,
    pub partition: PartitionId,
    /// Leader node id, `-1` while the partition is leaderless
    pub leader: NodeId,
    pub replicas: Vec<NodeId>,
    pub isr: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error_code: ErrorCode,
    pub topic: TopicName,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

// ---------------------------------------------------------------------------
// Consumer metadata (group coordinator lookup)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMetadataRequest {
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMetadataResponse {
    pub error_code: ErrorCode,
    pub coordinator_id: NodeId,
    pub host: String,
    pub port: i32,
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
}

/// A single message of a fetched message set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: Offset,
    pub attributes: i8,
    /// Broker timestamp, present from message format v1
    pub timestamp: Option<i64>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartition {
    pub partition: PartitionId,
    pub error_code: ErrorCode,
    pub high_watermark: Offset,
    /// Offset of the last message in `messages`, `None` when nothing new was returned
    pub last_offset: Option<Offset>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopic {
    pub topic: TopicName,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub topics: Vec<FetchTopic>,
}

impl FetchResponse {
    /// First partition of the first topic; the session only ever fetches one
    pub fn first_partition(&self) -> Option<(&str, &FetchPartition)> {
        self.topics.first().and_then(|topic| {
            topic
                .partitions
                .first()
                .map(|partition| (topic.topic.as_str(), partition))
        })
    }

    /// Last offset reported for the fetched partition
    pub fn last_offset(&self) -> Option<Offset> {
        self.first_partition()
            .and_then(|(_, partition)| partition.last_offset)
    }

    /// Error code reported for the fetched partition
    pub fn error_code(&self) -> ErrorCode {
        self.first_partition()
            .map(|(_, partition)| partition.error_code)
            .unwrap_or_default()
    }

    /// Records of the fetched partition in delivery order
    pub fn records(&self) -> Vec<ConsumeRecord> {
        match self.first_partition() {
            Some((topic, partition)) => partition
                .messages
                .iter()
                .map(|message| ConsumeRecord {
                    topic: topic.to_string(),
                    partition: partition.partition,
                    offset: message.offset,
                    key: message.key.clone(),
                    value: message.value.clone(),
                    timestamp: message.timestamp,
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

/// High-level record published to streaming sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRecord {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Offset fetch / commit
// ---------------------------------------------------------------------------

/// Stored offset lookup for one partition.
///
/// `group` overrides the session's consumer group in the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchRequest {
    pub group: Option<String>,
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl OffsetFetchRequest {
    pub fn new<T: Into<TopicName>>(topic: T, partition: PartitionId) -> Self {
        Self {
            group: None,
            topic: topic.into(),
            partition,
        }
    }

    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchPartition {
    pub partition: PartitionId,
    /// Committed offset, `-1` when the group has none for this partition
    pub offset: Offset,
    pub metadata: Option<String>,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchTopic {
    pub topic: TopicName,
    pub partitions: Vec<OffsetFetchPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetFetchResponse {
    pub topics: Vec<OffsetFetchTopic>,
}

impl OffsetFetchResponse {
    /// Stored offset of a partition, if the broker reported one
    pub fn offset(&self, topic: &str, partition: PartitionId) -> Option<Offset> {
        self.topics
            .iter()
            .filter(|t| t.topic == topic)
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition == partition)
            .map(|p| p.offset)
    }

    /// Error code of the first partition in the response
    pub fn error_code(&self) -> ErrorCode {
        self.topics
            .iter()
            .flat_map(|t| t.partitions.iter())
            .map(|p| p.error_code)
            .next()
            .unwrap_or_default()
    }
}

/// Offset commit for one partition.
///
/// `group` overrides the session's consumer group. `generation_id` and
/// `member_id` default to the "simple consumer" values `-1` and `""`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitRequest {
    pub group: Option<String>,
    pub generation_id: i32,
    pub member_id: String,
    pub retention_time_ms: i64,
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub metadata: String,
}

impl OffsetCommitRequest {
    pub fn new<T: Into<TopicName>>(topic: T, partition: PartitionId, offset: Offset) -> Self {
        Self {
            group: None,
            generation_id: -1,
            member_id: String::new(),
            retention_time_ms: -1,
            topic: topic.into(),
            partition,
            offset,
            metadata: String::new(),
        }
    }

    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Commit as a member of the given group generation
    pub fn with_member<S: Into<String>>(mut self, generation_id: i32, member_id: S) -> Self {
        self.generation_id = generation_id;
        self.member_id = member_id.into();
        self
    }

    pub fn with_metadata<S: Into<String>>(mut self, metadata: S) -> Self {
        self.metadata = metadata.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitPartition {
    pub partition: PartitionId,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitTopic {
    pub topic: TopicName,
    pub partitions: Vec<OffsetCommitPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetCommitResponse {
    pub topics: Vec<OffsetCommitTopic>,
}

impl OffsetCommitResponse {
    /// Error code of the first partition in the response
    pub fn error_code(&self) -> ErrorCode {
        self.topics
            .iter()
            .flat_map(|t| t.partitions.iter())
            .map(|p| p.error_code)
            .next()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Group membership
// ---------------------------------------------------------------------------

/// Protocol type announced when joining a consumer group
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";
/// Assignment protocol name announced when joining a consumer group
pub const CONSUMER_PROTOCOL_NAME: &str = "assign";

/// One supported assignment protocol and the topics subscribed under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProtocol {
    pub name: String,
    pub topics: Vec<TopicName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupRequest {
    pub group: String,
    pub session_timeout_ms: i32,
    pub member_id: String,
    pub protocol_type: String,
    pub protocols: Vec<GroupProtocol>,
}

/// A group member as reported to the group leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub member_id: String,
    pub topics: Vec<TopicName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupResponse {
    pub error_code: ErrorCode,
    pub generation_id: i32,
    pub group_protocol: String,
    pub leader_id: String,
    pub member_id: String,
    /// Member subscriptions; only populated for the group leader
    pub members: Vec<GroupMember>,
}

impl JoinGroupResponse {
    /// Whether this member was elected leader and must compute assignments
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.member_id == self.leader_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAssignment {
    pub topic: TopicName,
    pub partitions: Vec<PartitionId>,
}

impl TopicAssignment {
    pub fn new<T: Into<TopicName>>(topic: T, partitions: Vec<PartitionId>) -> Self {
        Self {
            topic: topic.into(),
            partitions,
        }
    }
}

/// Partitions the leader hands to one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAssignment {
    pub member_id: String,
    pub topics: Vec<TopicAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupRequest {
    pub group: String,
    pub generation_id: i32,
    pub member_id: String,
    pub assignments: Vec<MemberAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupResponse {
    pub error_code: ErrorCode,
    pub assignments: Vec<TopicAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub group: String,
    pub generation_id: i32,
    pub member_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveGroupRequest {
    pub group: String,
    pub member_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveGroupResponse {
    pub error_code: ErrorCode,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Every request the session can issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Metadata(MetadataRequest),
    ConsumerMetadata(ConsumerMetadataRequest),
    Fetch(FetchRequest),
    OffsetFetch(OffsetFetchRequest),
    OffsetCommit(OffsetCommitRequest),
    JoinGroup(JoinGroupRequest),
    SyncGroup(SyncGroupRequest),
    Heartbeat(HeartbeatRequest),
    LeaveGroup(LeaveGroupRequest),
}

impl Request {
    pub fn api_key(&self) -> ApiKey {
        match self {
            Request::Metadata(_) => ApiKey::Metadata,
            Request::ConsumerMetadata(_) => ApiKey::ConsumerMetadata,
            Request::Fetch(_) => ApiKey::Fetch,
            Request::OffsetFetch(_) => ApiKey::OffsetFetch,
            Request::OffsetCommit(_) => ApiKey::OffsetCommit,
            Request::JoinGroup(_) => ApiKey::JoinGroup,
            Request::SyncGroup(_) => ApiKey::SyncGroup,
            Request::Heartbeat(_) => ApiKey::Heartbeat,
            Request::LeaveGroup(_) => ApiKey::LeaveGroup,
        }
    }
}

/// Every response the session can decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Metadata(MetadataResponse),
    ConsumerMetadata(ConsumerMetadataResponse),
    Fetch(FetchResponse),
    OffsetFetch(OffsetFetchResponse),
    OffsetCommit(OffsetCommitResponse),
    JoinGroup(JoinGroupResponse),
    SyncGroup(SyncGroupResponse),
    Heartbeat(HeartbeatResponse),
    LeaveGroup(LeaveGroupResponse),
}

impl Response {
    pub fn api_key(&self) -> ApiKey {
        match self {
            Response::Metadata(_) => ApiKey::Metadata,
            Response::ConsumerMetadata(_) => ApiKey::ConsumerMetadata,
            Response::Fetch(_) => ApiKey::Fetch,
            Response::OffsetFetch(_) => ApiKey::OffsetFetch,
            Response::OffsetCommit(_) => ApiKey::OffsetCommit,
            Response::JoinGroup(_) => ApiKey::JoinGroup,
            Response::SyncGroup(_) => ApiKey::SyncGroup,
            Response::Heartbeat(_) => ApiKey::Heartbeat,
            Response::LeaveGroup(_) => ApiKey::LeaveGroup,
        }
    }
}

macro_rules! response_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Response {
                fn from(response: $ty) -> Self {
                    Response::$variant(response)
                }
            }

            impl TryFrom<Response> for $ty {
                type Error = SessionError;

                fn try_from(response: Response) -> Result<Self, Self::Error> {
                    match response {
                        Response::$variant(inner) => Ok(inner),
                        other => Err(SessionError::protocol(format!(
                            "Unexpected {:?} response, expected {:?}",
                            other.api_key(),
                            ApiKey::$variant
                        ))),
                    }
                }
            }
        )*
    };
}

response_conversions! {
    Metadata => MetadataResponse,
    ConsumerMetadata => ConsumerMetadataResponse,
    Fetch => FetchResponse,
    OffsetFetch => OffsetFetchResponse,
    OffsetCommit => OffsetCommitResponse,
    JoinGroup => JoinGroupResponse,
    SyncGroup => SyncGroupResponse,
    Heartbeat => HeartbeatResponse,
    LeaveGroup => LeaveGroupResponse,
}
