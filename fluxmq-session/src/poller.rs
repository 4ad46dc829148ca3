//! Streaming poller
//!
//! A stream is a chain of [`Command::PollTick`] messages. Each tick fetches
//! once, publishes the batch to the registered sink and posts the next tick
//! after `stream_poll_interval`. Only the tick carrying the id of the
//! currently registered stream may run; any other tick ends its chain.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fetch::FetchCursor;
use crate::protocol::ConsumeRecord;
use crate::session::{Command, Outcome, SessionState};

pub type StreamId = u64;

/// Sender a stream publishes its records into
pub type RecordSink = mpsc::UnboundedSender<ConsumeRecord>;

/// The active stream
#[derive(Debug)]
pub(crate) struct StreamRegistration {
    pub(crate) id: StreamId,
    pub(crate) sink: RecordSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollerState {
    Active(FetchCursor),
    Cancelled,
}

impl SessionState {
    /// Register `sink` as the active stream and run its first tick right away.
    /// A previously active stream is replaced and stops on its next tick.
    pub(crate) fn start_streaming(&mut self, cursor: FetchCursor, sink: RecordSink) -> StreamId {
        self.next_stream_id += 1;
        let id = self.next_stream_id;

        if let Some(previous) = self.stream.replace(StreamRegistration { id, sink }) {
            info!("Stream {} replaced by stream {}", previous.id, id);
        }
        info!(
            "Streaming {}:{} from offset {} (stream {})",
            cursor.topic, cursor.partition, cursor.offset, id
        );

        self.schedule_poll(id, cursor, Duration::ZERO);
        id
    }

    pub(crate) fn stop_streaming(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("Stream {} stopped", stream.id);
        }
    }

    /// Run one poller tick
    pub(crate) async fn poll_tick(
        &mut self,
        stream_id: StreamId,
        cursor: FetchCursor,
    ) -> PollerState {
        let sink = match &self.stream {
            Some(stream) if stream.id == stream_id => {
                if stream.sink.is_closed() {
                    self.stream = None;
                    info!("Stream {} receiver dropped", stream_id);
                    return PollerState::Cancelled;
                }
                stream.sink.clone()
            }
            _ => {
                debug!("Stream {} cancelled", stream_id);
                return PollerState::Cancelled;
            }
        };

        let next = match self.fetch(&cursor).await {
            Ok(Outcome::Completed(response)) => {
                for record in response.records() {
                    if sink.send(record).is_err() {
                        // receiver gone; the next tick cancels
                        break;
                    }
                }
                match response.last_offset() {
                    Some(last_offset) => cursor.at(last_offset + 1),
                    None => cursor,
                }
            }
            Ok(Outcome::TopicNotFound) => cursor,
            Err(e) => {
                warn!(
                    "Stream {} fetch of {}:{} at {} failed: {}",
                    stream_id, cursor.topic, cursor.partition, cursor.offset, e
                );
                cursor
            }
        };

        PollerState::Active(next)
    }

    /// Run a tick and schedule the following one while the stream is active
    pub(crate) async fn handle_poll_tick(&mut self, stream_id: StreamId, cursor: FetchCursor) {
        if let PollerState::Active(next) = self.poll_tick(stream_id, cursor).await {
            self.schedule_poll(stream_id, next, self.config.stream_poll_interval);
        }
    }

    fn schedule_poll(&self, stream_id: StreamId, cursor: FetchCursor, delay: Duration) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::PollTick { stream_id, cursor });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ApiKey, Request};
    use crate::testing::*;

    fn streaming_cluster() -> MockCluster {
        MockCluster::new(|_, request| match request {
            Request::Metadata(_) => metadata_response(&[(1, "b1", 9092)], &[("t", 0, 1)]),
            Request::Fetch(req) => {
                let offsets: Vec<i64> = (req.offset..req.offset + 2).collect();
                fetch_response(&req.topic, req.partition, &offsets)
            }
            _ => MockReply::Disconnect,
        })
    }

    #[tokio::test]
    async fn test_tick_publishes_and_advances() {
        let mock = streaming_cluster();
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (sink, mut records) = mpsc::unbounded_channel();
        let id = state.start_streaming(FetchCursor::new("t", 0, 10), sink);

        let next = state.poll_tick(id, FetchCursor::new("t", 0, 10)).await;

        assert_eq!(next, PollerState::Active(FetchCursor::new("t", 0, 12)));
        assert_eq!(records.recv().await.unwrap().offset, 10);
        assert_eq!(records.recv().await.unwrap().offset, 11);
        assert!(records.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tick_keeps_offset_when_topic_missing() {
        let mock = MockCluster::new(|_, _| metadata_response(&[(1, "b1", 9092)], &[]));
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (sink, mut records) = mpsc::unbounded_channel();
        let id = state.start_streaming(FetchCursor::new("t", 0, 3), sink);

        let next = state.poll_tick(id, FetchCursor::new("t", 0, 3)).await;

        assert_eq!(next, PollerState::Active(FetchCursor::new("t", 0, 3)));
        assert!(records.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tick_keeps_offset_on_fetch_error() {
        let mock = MockCluster::new(|_, request| match request {
            Request::Metadata(_) => metadata_response(&[(1, "b1", 9092)], &[("t", 0, 1)]),
            _ => MockReply::Disconnect,
        });
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (sink, _records) = mpsc::unbounded_channel();
        let id = state.start_streaming(FetchCursor::new("t", 0, 3), sink);

        let next = state.poll_tick(id, FetchCursor::new("t", 0, 3)).await;

        assert_eq!(next, PollerState::Active(FetchCursor::new("t", 0, 3)));
    }

    #[tokio::test]
    async fn test_stopped_stream_cancels_without_round_trip() {
        let mock = streaming_cluster();
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (sink, _records) = mpsc::unbounded_channel();
        let id = state.start_streaming(FetchCursor::new("t", 0, 0), sink);

        state.stop_streaming();
        let next = state.poll_tick(id, FetchCursor::new("t", 0, 0)).await;

        assert_eq!(next, PollerState::Cancelled);
        assert_eq!(state.correlation_id(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels() {
        let mock = streaming_cluster();
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (sink, records) = mpsc::unbounded_channel();
        let id = state.start_streaming(FetchCursor::new("t", 0, 0), sink);

        drop(records);
        let next = state.poll_tick(id, FetchCursor::new("t", 0, 0)).await;

        assert_eq!(next, PollerState::Cancelled);
        assert!(mock.round_trips().is_empty());
        assert!(state.stream.is_none());
    }

    #[tokio::test]
    async fn test_stale_tick_keeps_current_stream() {
        let mock = streaming_cluster();
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (first_sink, first) = mpsc::unbounded_channel();
        let (second_sink, _second) = mpsc::unbounded_channel();

        let old = state.start_streaming(FetchCursor::new("t", 0, 0), first_sink);
        let current = state.start_streaming(FetchCursor::new("t", 0, 50), second_sink);
        drop(first);

        let next = state.poll_tick(old, FetchCursor::new("t", 0, 0)).await;

        assert_eq!(next, PollerState::Cancelled);
        assert_eq!(state.stream.as_ref().map(|s| s.id), Some(current));
    }

    #[tokio::test]
    async fn test_replaced_stream_cancels_old_ticks() {
        let mock = streaming_cluster();
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));
        let (first_sink, _first) = mpsc::unbounded_channel();
        let (second_sink, _second) = mpsc::unbounded_channel();

        let first = state.start_streaming(FetchCursor::new("t", 0, 0), first_sink);
        let second = state.start_streaming(FetchCursor::new("t", 0, 50), second_sink);
        assert_ne!(first, second);

        assert_eq!(
            state.poll_tick(first, FetchCursor::new("t", 0, 0)).await,
            PollerState::Cancelled
        );
        assert!(matches!(
            state.poll_tick(second, FetchCursor::new("t", 0, 50)).await,
            PollerState::Active(_)
        ));
    }

    #[tokio::test]
    async fn test_start_posts_first_tick() {
        let mock = streaming_cluster();
        let (mut state, mut commands) = mock.state(config(&["b1:9092"], None));
        let (sink, _records) = mpsc::unbounded_channel();

        let id = state.start_streaming(FetchCursor::new("t", 0, 4), sink);

        match commands.recv().await {
            Some(Command::PollTick { stream_id, cursor }) => {
                assert_eq!(stream_id, id);
                assert_eq!(cursor.offset, 4);
            }
            other => panic!("Expected poll tick, got {:?}", other),
        }
        assert!(mock
            .round_trips()
            .iter()
            .all(|t| t.api_key != ApiKey::Fetch));
    }
}
