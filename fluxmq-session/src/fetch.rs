//! Partition fetch with optional auto-commit

use tracing::{debug, error};

use crate::protocol::{
    FetchRequest, FetchResponse, Offset, OffsetCommitRequest, PartitionId, Request, TopicName,
};
use crate::session::{duration_ms, Outcome, SessionState};
use crate::Result;

/// Position of a single-partition read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCursor {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    /// Commit the last fetched offset after every non-empty fetch
    pub auto_commit: bool,
    /// Group to commit for instead of the session's
    pub group: Option<String>,
}

impl FetchCursor {
    pub fn new<T: Into<TopicName>>(topic: T, partition: PartitionId, offset: Offset) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            auto_commit: false,
            group: None,
        }
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = Some(group.into());
        self
    }

    /// The same cursor positioned at `offset`
    pub fn at(&self, offset: Offset) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

impl SessionState {
    /// Fetch one batch from the partition leader.
    ///
    /// With auto-commit on, a non-empty batch commits its last offset as is
    /// (not `last + 1`) before the response is returned.
    pub(crate) async fn fetch(&mut self, cursor: &FetchCursor) -> Result<Outcome<FetchResponse>> {
        if cursor.auto_commit {
            self.config.consumer_group.require("fetch")?;
        }

        let leader = match self.resolve_leader(&cursor.topic, cursor.partition).await {
            Outcome::Completed(leader) => leader,
            Outcome::TopicNotFound => {
                error!(
                    "Fetch failed: no leader for {}:{}",
                    cursor.topic, cursor.partition
                );
                return Ok(Outcome::TopicNotFound);
            }
        };

        let fetch_config = &self.config.fetch_config;
        let request = Request::Fetch(FetchRequest {
            topic: cursor.topic.clone(),
            partition: cursor.partition,
            offset: cursor.offset,
            max_wait_ms: duration_ms(fetch_config.max_wait),
            min_bytes: fetch_config.min_bytes,
            max_bytes: fetch_config.max_bytes,
        });

        let response: FetchResponse = self.send_to(&leader, request).await?;

        let error_code = response.error_code();
        if error_code.is_leader_error()
            && self.cluster.invalidate(&cursor.topic, cursor.partition)
        {
            debug!(
                "Leader {} of {}:{} is stale ({}), dropped from cache",
                leader, cursor.topic, cursor.partition, error_code
            );
        }

        if cursor.auto_commit {
            if let Some(last_offset) = response.last_offset() {
                let mut commit =
                    OffsetCommitRequest::new(cursor.topic.clone(), cursor.partition, last_offset);
                if let Some(group) = &cursor.group {
                    commit = commit.with_group(group.clone());
                }
                self.offset_commit(commit).await?;
            }
        }

        Ok(Outcome::Completed(response))
    }
}
