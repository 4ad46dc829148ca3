//! Scripted broker cluster for session tests
//!
//! [`MockCluster`] is both the codec and the connector of a test session.
//! Encoding only remembers the typed request under its correlation id; the
//! mock connection hands that request to a responder closure and the decoder
//! returns whatever the closure answered. Every round trip is recorded.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec::Codec;
use crate::config::{SessionConfig, SessionConfigBuilder};
use crate::connection::{Connection, Connector};
use crate::error::{ErrorCode, SessionError};
use crate::protocol::*;
use crate::session::{Command, Session, SessionState};
use crate::Result;

/// What a scripted broker does with a request
pub(crate) enum MockReply {
    Respond(Response),
    /// Respond under a different correlation id
    Misrouted(Response),
    /// Hold the request until the sync timeout expires
    Timeout,
    Disconnect,
}

/// One request as seen by a broker
#[derive(Debug, Clone)]
pub(crate) struct RoundTrip {
    pub(crate) broker: String,
    pub(crate) api_key: ApiKey,
    pub(crate) correlation_id: CorrelationId,
    pub(crate) request: Request,
}

type Responder = Box<dyn FnMut(&str, &Request) -> MockReply + Send>;

struct Inner {
    responder: Responder,
    encoded: HashMap<CorrelationId, Request>,
    replies: HashMap<CorrelationId, Response>,
    round_trips: Vec<RoundTrip>,
    opened: Vec<String>,
}

#[derive(Clone)]
pub(crate) struct MockCluster {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MockCluster")
            .field("round_trips", &inner.round_trips.len())
            .field("opened", &inner.opened)
            .finish()
    }
}

impl MockCluster {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str, &Request) -> MockReply + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                responder: Box::new(responder),
                encoded: HashMap::new(),
                replies: HashMap::new(),
                round_trips: Vec::new(),
                opened: Vec::new(),
            })),
        }
    }

    /// Session state wired to this cluster, outside of any actor
    pub(crate) fn state(&self, config: SessionConfig) -> (SessionState, CommandQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = SessionState::new(
            config,
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            sender.downgrade(),
        )
        .expect("valid test configuration");
        (
            state,
            CommandQueue {
                _sender: sender,
                receiver,
            },
        )
    }

    /// A running session wired to this cluster
    pub(crate) fn session(&self, config: SessionConfig) -> Session {
        Session::start_with(config, Arc::new(self.clone()), Arc::new(self.clone()))
            .expect("valid test configuration")
    }

    pub(crate) fn round_trips(&self) -> Vec<RoundTrip> {
        self.inner.lock().round_trips.clone()
    }

    pub(crate) fn api_keys(&self) -> Vec<ApiKey> {
        self.inner
            .lock()
            .round_trips
            .iter()
            .map(|t| t.api_key)
            .collect()
    }

    /// Brokers a connection was opened to, in order
    pub(crate) fn opened(&self) -> Vec<String> {
        self.inner.lock().opened.clone()
    }
}

fn correlation_frame(correlation_id: CorrelationId) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(correlation_id);
    buf.freeze()
}

impl Codec for MockCluster {
    fn encode(
        &self,
        request: &Request,
        correlation_id: CorrelationId,
        _client_id: &str,
    ) -> Result<Bytes> {
        self.inner
            .lock()
            .encoded
            .insert(correlation_id, request.clone());
        Ok(correlation_frame(correlation_id))
    }

    fn decode(&self, _api_key: ApiKey, mut frame: Bytes) -> Result<(CorrelationId, Response)> {
        let correlation_id = frame.get_i32();
        let response = self
            .inner
            .lock()
            .replies
            .remove(&correlation_id)
            .ok_or_else(|| {
                SessionError::deserialization(format!("No reply for {}", correlation_id))
            })?;
        Ok((correlation_id, response))
    }
}

impl Connector for MockCluster {
    fn open_connection(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>> {
        let broker = format!("{}:{}", host, port);
        self.inner.lock().opened.push(broker.clone());
        Ok(Arc::new(MockConnection {
            broker,
            cluster: self.clone(),
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    broker: String,
    cluster: MockCluster,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_sync(&self, mut request: Bytes, timeout: Duration) -> Result<Bytes> {
        let correlation_id = request.get_i32();

        let reply = {
            let mut guard = self.cluster.inner.lock();
            let inner = &mut *guard;
            let request = inner.encoded.remove(&correlation_id).ok_or_else(|| {
                SessionError::serialization(format!("Unknown request {}", correlation_id))
            })?;
            inner.round_trips.push(RoundTrip {
                broker: self.broker.clone(),
                api_key: request.api_key(),
                correlation_id,
                request: request.clone(),
            });
            (inner.responder)(&self.broker, &request)
        };

        match reply {
            MockReply::Respond(response) => {
                self.cluster
                    .inner
                    .lock()
                    .replies
                    .insert(correlation_id, response);
                Ok(correlation_frame(correlation_id))
            }
            MockReply::Misrouted(response) => {
                let other = correlation_id.wrapping_add(1000);
                self.cluster.inner.lock().replies.insert(other, response);
                Ok(correlation_frame(other))
            }
            MockReply::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(SessionError::timeout(timeout.as_millis() as u64))
            }
            MockReply::Disconnect => Err(SessionError::connection(format!(
                "{} is unreachable",
                self.broker
            ))),
        }
    }
}

/// Command queue of a state built by [`MockCluster::state`]; keeps the
/// queue open so scheduled ticks can be observed
pub(crate) struct CommandQueue {
    _sender: mpsc::UnboundedSender<Command>,
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl CommandQueue {
    pub(crate) async fn recv(&mut self) -> Option<Command> {
        self.receiver.recv().await
    }
}

pub(crate) fn config(brokers: &[&str], group: Option<&str>) -> SessionConfig {
    let builder = SessionConfigBuilder::new()
        .brokers(brokers.iter().copied())
        .client_id("test-client")
        .sync_timeout(Duration::from_millis(100));

    match group {
        Some(group) => builder.consumer_group(group),
        None => builder.no_consumer_group(),
    }
    .build()
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

/// `brokers` are `(node id, host, port)`, `leaders` are `(topic, partition, leader node id)`
pub(crate) fn metadata_response(
    brokers: &[(NodeId, &str, i32)],
    leaders: &[(&str, PartitionId, NodeId)],
) -> MockReply {
    let mut topics: Vec<TopicMetadata> = Vec::new();
    for &(topic, partition, leader) in leaders {
        let metadata = PartitionMetadata {
            error_code: ErrorCode::None,
            partition,
            leader,
            replicas: vec![leader],
            isr: vec![leader],
        };
        match topics.iter_mut().find(|t| t.topic == topic) {
            Some(existing) => existing.partitions.push(metadata),
            None => topics.push(TopicMetadata {
                error_code: ErrorCode::None,
                topic: topic.to_string(),
                partitions: vec![metadata],
            }),
        }
    }

    MockReply::Respond(Response::Metadata(MetadataResponse {
        brokers: brokers
            .iter()
            .map(|&(node_id, host, port)| BrokerMetadata {
                node_id,
                host: host.to_string(),
                port,
            })
            .collect(),
        topics,
    }))
}

pub(crate) fn coordinator_response(node_id: NodeId, host: &str, port: i32) -> MockReply {
    MockReply::Respond(Response::ConsumerMetadata(ConsumerMetadataResponse {
        error_code: ErrorCode::None,
        coordinator_id: node_id,
        host: host.to_string(),
        port,
    }))
}

pub(crate) fn coordinator_error(error_code: ErrorCode) -> MockReply {
    MockReply::Respond(Response::ConsumerMetadata(ConsumerMetadataResponse {
        error_code,
        coordinator_id: -1,
        host: String::new(),
        port: -1,
    }))
}

fn fetch_partition(
    topic: &str,
    partition: PartitionId,
    error_code: ErrorCode,
    offsets: &[Offset],
) -> MockReply {
    let messages: Vec<Message> = offsets
        .iter()
        .map(|&offset| Message {
            offset,
            attributes: 0,
            timestamp: None,
            key: None,
            value: Some(Bytes::from(format!("value-{}", offset))),
        })
        .collect();

    MockReply::Respond(Response::Fetch(FetchResponse {
        topics: vec![FetchTopic {
            topic: topic.to_string(),
            partitions: vec![FetchPartition {
                partition,
                error_code,
                high_watermark: offsets.last().map_or(0, |last| last + 1),
                last_offset: offsets.last().copied(),
                messages,
            }],
        }],
    }))
}

/// One message per offset, valued `value-<offset>`
pub(crate) fn fetch_response(topic: &str, partition: PartitionId, offsets: &[Offset]) -> MockReply {
    fetch_partition(topic, partition, ErrorCode::None, offsets)
}

pub(crate) fn fetch_error(topic: &str, partition: PartitionId, error_code: ErrorCode) -> MockReply {
    fetch_partition(topic, partition, error_code, &[])
}

pub(crate) fn offset_fetch_response(topic: &str, partition: PartitionId, offset: Offset) -> MockReply {
    MockReply::Respond(Response::OffsetFetch(OffsetFetchResponse {
        topics: vec![OffsetFetchTopic {
            topic: topic.to_string(),
            partitions: vec![OffsetFetchPartition {
                partition,
                offset,
                metadata: None,
                error_code: ErrorCode::None,
            }],
        }],
    }))
}

pub(crate) fn offset_commit_error(
    topic: &str,
    partition: PartitionId,
    error_code: ErrorCode,
) -> MockReply {
    MockReply::Respond(Response::OffsetCommit(OffsetCommitResponse {
        topics: vec![OffsetCommitTopic {
            topic: topic.to_string(),
            partitions: vec![OffsetCommitPartition {
                partition,
                error_code,
            }],
        }],
    }))
}

pub(crate) fn offset_commit_response(topic: &str, partition: PartitionId) -> MockReply {
    offset_commit_error(topic, partition, ErrorCode::None)
}

/// Join answer electing `member_id` as leader
pub(crate) fn join_response(member_id: &str, generation_id: i32) -> MockReply {
    MockReply::Respond(Response::JoinGroup(JoinGroupResponse {
        error_code: ErrorCode::None,
        generation_id,
        group_protocol: CONSUMER_PROTOCOL_NAME.to_string(),
        leader_id: member_id.to_string(),
        member_id: member_id.to_string(),
        members: Vec::new(),
    }))
}

pub(crate) fn sync_response(assignments: Vec<TopicAssignment>) -> MockReply {
    MockReply::Respond(Response::SyncGroup(SyncGroupResponse {
        error_code: ErrorCode::None,
        assignments,
    }))
}

pub(crate) fn heartbeat_response(error_code: ErrorCode) -> MockReply {
    MockReply::Respond(Response::Heartbeat(HeartbeatResponse { error_code }))
}

pub(crate) fn leave_response(error_code: ErrorCode) -> MockReply {
    MockReply::Respond(Response::LeaveGroup(LeaveGroupResponse { error_code }))
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// Formatted log output of the current thread
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Number of events logged at `level` ("ERROR", "WARN", ...)
    pub(crate) fn count(&self, level: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.trim_start().starts_with(level))
            .count()
    }
}

/// Route this thread's events into a [`LogCapture`] until the guard drops
pub(crate) fn capture_logs() -> (tracing::subscriber::DefaultGuard, LogCapture) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .finish();

    (tracing::subscriber::set_default(subscriber), capture)
}
