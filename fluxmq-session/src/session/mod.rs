//! Session actor and its caller-facing handle
//!
//! All session state lives in one [`SessionState`] owned by a single tokio
//! task. Callers, timers and the streaming poller talk to it through one
//! command queue, so every round trip and every correlation id is issued in
//! queue order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::cluster::{Broker, BrokerId, ClusterMetadata};
use crate::codec::{Codec, KafkaCodec};
use crate::config::{GroupIdentity, SessionConfig};
use crate::connection::{Connection, Connector, TcpConnector};
use crate::coordinator::ConsumerGroupMetadata;
use crate::error::SessionError;
use crate::fetch::FetchCursor;
use crate::poller::{RecordSink, StreamId, StreamRegistration};
use crate::protocol::{
    CorrelationId, FetchResponse, HeartbeatResponse, JoinGroupResponse, LeaveGroupResponse,
    MemberAssignment, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, Request, Response, SyncGroupResponse, TopicName,
};
use crate::Result;


/// Result of an operation that depends on a partition leader or a group
/// coordinator that may not be resolvable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    TopicNotFound,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::TopicNotFound => None,
        }
    }

    pub fn is_topic_not_found(&self) -> bool {
        matches!(self, Outcome::TopicNotFound)
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::TopicNotFound => Outcome::TopicNotFound,
        }
    }
}

/// Milliseconds of a duration as a wire `i32`, saturating
pub(crate) fn duration_ms(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages processed by the session actor
#[derive(Debug)]
pub(crate) enum Command {
    ConsumerGroup {
        reply: oneshot::Sender<GroupIdentity>,
    },
    Metadata {
        reply: Reply<ClusterMetadata>,
    },
    Fetch {
        cursor: FetchCursor,
        reply: Reply<Outcome<FetchResponse>>,
    },
    OffsetFetch {
        request: OffsetFetchRequest,
        reply: Reply<Outcome<OffsetFetchResponse>>,
    },
    OffsetCommit {
        request: OffsetCommitRequest,
        reply: Reply<OffsetCommitResponse>,
    },
    ConsumerGroupMetadata {
        reply: Reply<ConsumerGroupMetadata>,
    },
    JoinGroup {
        topics: Vec<TopicName>,
        session_timeout: Duration,
        reply: Reply<Outcome<JoinGroupResponse>>,
    },
    SyncGroup {
        group: String,
        generation_id: i32,
        member_id: String,
        assignments: Vec<MemberAssignment>,
        reply: Reply<Outcome<SyncGroupResponse>>,
    },
    Heartbeat {
        group: String,
        generation_id: i32,
        member_id: String,
        reply: Reply<Outcome<HeartbeatResponse>>,
    },
    LeaveGroup {
        group: String,
        member_id: String,
        reply: Reply<Outcome<LeaveGroupResponse>>,
    },
    StartStreaming {
        cursor: FetchCursor,
        sink: RecordSink,
    },
    StopStreaming,
    UpdateConsumerMetadata,
    CorrelationId {
        reply: oneshot::Sender<CorrelationId>,
    },
    MetadataTick,
    CoordinatorTick,
    PollTick {
        stream_id: StreamId,
        cursor: FetchCursor,
    },
}

/// Everything the session knows, owned by the actor task
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) config: SessionConfig,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) brokers: Vec<Broker>,
    pub(crate) cluster: ClusterMetadata,
    pub(crate) consumer_group: ConsumerGroupMetadata,
    pub(crate) correlation_id: CorrelationId,
    pub(crate) stream: Option<StreamRegistration>,
    pub(crate) next_stream_id: StreamId,
    pub(crate) commands: mpsc::WeakUnboundedSender<Command>,
}

impl SessionState {
    /// Validate the configuration and open a connection to every configured broker
    pub(crate) fn new(
        config: SessionConfig,
        codec: Arc<dyn Codec>,
        connector: Arc<dyn Connector>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Result<Self> {
        let addresses = config.validate()?;

        let mut state = Self {
            config,
            codec,
            connector,
            brokers: Vec::with_capacity(addresses.len()),
            cluster: ClusterMetadata::default(),
            consumer_group: ConsumerGroupMetadata::default(),
            correlation_id: 0,
            stream: None,
            next_stream_id: 0,
            commands,
        };

        for (host, port) in addresses {
            state.register_broker(&host, port, None)?;
        }

        Ok(state)
    }

    /// Next correlation id to be issued
    pub(crate) fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub(crate) fn cluster(&self) -> &ClusterMetadata {
        &self.cluster
    }

    pub(crate) fn consumer_group_metadata(&self) -> &ConsumerGroupMetadata {
        &self.consumer_group
    }

    /// One round trip to a known broker.
    ///
    /// Consumes exactly one correlation id once the broker is known, whether
    /// or not the round trip succeeds.
    pub(crate) async fn send_to<R>(&mut self, broker: &BrokerId, request: Request) -> Result<R>
    where
        R: TryFrom<Response, Error = SessionError>,
    {
        let connection = self.connection(broker)?;
        let correlation_id = self.next_correlation_id();
        self.round_trip(broker, connection, request, correlation_id)
            .await
    }

    /// Round trip under a correlation id the caller already took, leaving the
    /// counter alone
    pub(crate) async fn send_with_id<R>(
        &mut self,
        broker: &BrokerId,
        request: Request,
        correlation_id: CorrelationId,
    ) -> Result<R>
    where
        R: TryFrom<Response, Error = SessionError>,
    {
        let connection = self.connection(broker)?;
        self.round_trip(broker, connection, request, correlation_id)
            .await
    }

    pub(crate) fn next_correlation_id(&mut self) -> CorrelationId {
        let correlation_id = self.correlation_id;
        self.correlation_id = self.correlation_id.wrapping_add(1);
        correlation_id
    }

    fn connection(&self, broker: &BrokerId) -> Result<Arc<dyn Connection>> {
        self.brokers
            .iter()
            .find(|b| &b.id == broker)
            .map(|b| Arc::clone(&b.connection))
            .ok_or(SessionError::NoBrokersAvailable)
    }

    async fn round_trip<R>(
        &mut self,
        broker: &BrokerId,
        connection: Arc<dyn Connection>,
        request: Request,
        correlation_id: CorrelationId,
    ) -> Result<R>
    where
        R: TryFrom<Response, Error = SessionError>,
    {
        let api_key = request.api_key();
        debug!(
            "Sending {:?} to {} (correlation id {})",
            api_key, broker, correlation_id
        );

        let frame = self
            .codec
            .encode(&request, correlation_id, &self.config.client_id)?;
        let reply = connection.send_sync(frame, self.config.sync_timeout).await?;
        let (received, response) = self.codec.decode(api_key, reply)?;

        if received != correlation_id {
            return Err(SessionError::CorrelationMismatch {
                expected: correlation_id,
                received,
            });
        }

        R::try_from(response)
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::ConsumerGroup { reply } => {
                let _ = reply.send(self.config.consumer_group.clone());
            }
            Command::Metadata { reply } => {
                let result = self.refresh_metadata().await.map(|_| self.cluster.clone());
                let _ = reply.send(result);
            }
            Command::Fetch { cursor, reply } => {
                let _ = reply.send(self.fetch(&cursor).await);
            }
            Command::OffsetFetch { request, reply } => {
                let _ = reply.send(self.offset_fetch(request).await);
            }
            Command::OffsetCommit { request, reply } => {
                let _ = reply.send(self.offset_commit(request).await);
            }
            Command::ConsumerGroupMetadata { reply } => {
                let _ = reply.send(self.update_consumer_metadata().await);
            }
            Command::JoinGroup {
                topics,
                session_timeout,
                reply,
            } => {
                let _ = reply.send(self.join_group(topics, session_timeout).await);
            }
            Command::SyncGroup {
                group,
                generation_id,
                member_id,
                assignments,
                reply,
            } => {
                let result = self
                    .sync_group(group, generation_id, member_id, assignments)
                    .await;
                let _ = reply.send(result);
            }
            Command::Heartbeat {
                group,
                generation_id,
                member_id,
                reply,
            } => {
                let _ = reply.send(self.heartbeat(group, generation_id, member_id).await);
            }
            Command::LeaveGroup {
                group,
                member_id,
                reply,
            } => {
                let _ = reply.send(self.leave_group(group, member_id).await);
            }
            Command::StartStreaming { cursor, sink } => {
                self.start_streaming(cursor, sink);
            }
            Command::StopStreaming => self.stop_streaming(),
            Command::UpdateConsumerMetadata => {
                if let Err(e) = self.update_consumer_metadata().await {
                    warn!("Consumer metadata update ignored: {}", e);
                }
            }
            Command::CorrelationId { reply } => {
                let _ = reply.send(self.correlation_id);
            }
            Command::MetadataTick => {
                if let Err(e) = self.refresh_metadata().await {
                    debug!("Periodic metadata refresh failed: {}", e);
                }
            }
            Command::CoordinatorTick => {
                if self.config.consumer_group.is_group() {
                    if let Err(e) = self.discover_coordinator(false).await {
                        debug!("Periodic coordinator refresh failed: {}", e);
                    }
                }
            }
            Command::PollTick { stream_id, cursor } => {
                self.handle_poll_tick(stream_id, cursor).await;
            }
        }
    }
}

async fn run(
    mut state: SessionState,
    mut commands: mpsc::UnboundedReceiver<Command>,
    _timers: DropGuard,
) {
    while let Some(command) = commands.recv().await {
        state.handle(command).await;
    }
    debug!("Session for {} stopped", state.config.client_id);
}

/// Post `make()` into the queue every `period`, until the session goes away
fn spawn_timer(
    period: Duration,
    commands: mpsc::WeakUnboundedSender<Command>,
    shutdown: CancellationToken,
    make: fn() -> Command,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(commands) = commands.upgrade() else { break };
                    if commands.send(make()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Handle to a running session.
///
/// Cloning is cheap; the actor stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    /// Start a session over TCP with the Kafka wire codec.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SessionConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.sync_timeout);
        Self::start_with(config, Arc::new(KafkaCodec), Arc::new(connector))
    }

    /// Start a session with a custom codec and transport
    pub fn start_with(
        config: SessionConfig,
        codec: Arc<dyn Codec>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SessionState::new(config, codec, connector, tx.downgrade())?;

        let shutdown = CancellationToken::new();
        spawn_timer(
            state.config.metadata_update_interval,
            tx.downgrade(),
            shutdown.clone(),
            || Command::MetadataTick,
        );
        if state.config.consumer_group.is_group() {
            spawn_timer(
                state.config.consumer_group_update_interval,
                tx.downgrade(),
                shutdown.clone(),
                || Command::CoordinatorTick,
            );
        }

        info!(
            "Session {} started with {} brokers, group {}",
            state.config.client_id,
            state.brokers.len(),
            state.config.consumer_group
        );
        tokio::spawn(run(state, rx, shutdown.drop_guard()));

        Ok(Self { commands: tx })
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)
    }

    fn cast(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Consumer group the session was configured with
    pub async fn consumer_group(&self) -> Result<GroupIdentity> {
        self.call(|reply| Command::ConsumerGroup { reply }).await
    }

    /// Refresh and return cluster metadata
    pub async fn metadata(&self) -> Result<ClusterMetadata> {
        self.call(|reply| Command::Metadata { reply }).await?
    }

    /// Fetch one batch at the cursor
    pub async fn fetch(&self, cursor: FetchCursor) -> Result<Outcome<FetchResponse>> {
        self.call(|reply| Command::Fetch { cursor, reply }).await?
    }

    pub async fn offset_fetch(
        &self,
        request: OffsetFetchRequest,
    ) -> Result<Outcome<OffsetFetchResponse>> {
        self.call(|reply| Command::OffsetFetch { request, reply })
            .await?
    }

    pub async fn offset_commit(&self, request: OffsetCommitRequest) -> Result<OffsetCommitResponse> {
        self.call(|reply| Command::OffsetCommit { request, reply })
            .await?
    }

    /// Rediscover the group coordinator and return the result
    pub async fn consumer_group_metadata(&self) -> Result<ConsumerGroupMetadata> {
        self.call(|reply| Command::ConsumerGroupMetadata { reply })
            .await?
    }

    /// Join the session's consumer group as a new member
    pub async fn join_group(
        &self,
        topics: Vec<TopicName>,
        session_timeout: Duration,
    ) -> Result<Outcome<JoinGroupResponse>> {
        self.call(|reply| Command::JoinGroup {
            topics,
            session_timeout,
            reply,
        })
        .await?
    }

    pub async fn sync_group(
        &self,
        group: impl Into<String>,
        generation_id: i32,
        member_id: impl Into<String>,
        assignments: Vec<MemberAssignment>,
    ) -> Result<Outcome<SyncGroupResponse>> {
        let group = group.into();
        let member_id = member_id.into();
        self.call(|reply| Command::SyncGroup {
            group,
            generation_id,
            member_id,
            assignments,
            reply,
        })
        .await?
    }

    pub async fn heartbeat(
        &self,
        group: impl Into<String>,
        generation_id: i32,
        member_id: impl Into<String>,
    ) -> Result<Outcome<HeartbeatResponse>> {
        let group = group.into();
        let member_id = member_id.into();
        self.call(|reply| Command::Heartbeat {
            group,
            generation_id,
            member_id,
            reply,
        })
        .await?
    }

    pub async fn leave_group(
        &self,
        group: impl Into<String>,
        member_id: impl Into<String>,
    ) -> Result<Outcome<LeaveGroupResponse>> {
        let group = group.into();
        let member_id = member_id.into();
        self.call(|reply| Command::LeaveGroup {
            group,
            member_id,
            reply,
        })
        .await?
    }

    /// Stream records from the cursor into `sink`, replacing any active stream
    pub fn start_streaming(&self, cursor: FetchCursor, sink: RecordSink) -> Result<()> {
        self.cast(Command::StartStreaming { cursor, sink })
    }

    pub fn stop_streaming(&self) -> Result<()> {
        self.cast(Command::StopStreaming)
    }

    /// Trigger coordinator rediscovery without waiting for it
    pub fn update_consumer_metadata(&self) -> Result<()> {
        self.cast(Command::UpdateConsumerMetadata)
    }

    /// Next correlation id the session will issue
    pub async fn correlation_id(&self) -> Result<CorrelationId> {
        self.call(|reply| Command::CorrelationId { reply }).await
    }
}
