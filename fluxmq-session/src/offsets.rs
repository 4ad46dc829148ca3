//! Consumer offset fetch and commit
//!
//! Fetch fails closed: without a coordinator nothing is sent. Commit fails
//! open: without a coordinator it still goes to the bootstrap broker.

use tracing::{debug, warn};

use crate::error::SessionError;
use crate::protocol::{
    OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse, Request,
};
use crate::session::{Outcome, SessionState};
use crate::Result;

impl SessionState {
    /// Stored offset lookup against the group coordinator
    pub(crate) async fn offset_fetch(
        &mut self,
        mut request: OffsetFetchRequest,
    ) -> Result<Outcome<OffsetFetchResponse>> {
        let session_group = self
            .config
            .consumer_group
            .require("offset_fetch")?
            .to_string();

        let Some(coordinator) = self.coordinator_for("offset_fetch").await? else {
            return Ok(Outcome::TopicNotFound);
        };

        request.group.get_or_insert(session_group);

        let response: OffsetFetchResponse = self
            .send_to(&coordinator, Request::OffsetFetch(request))
            .await?;
        self.observe_group_error(response.error_code());
        Ok(Outcome::Completed(response))
    }

    /// Commit one partition offset for the request's group, or the session's
    pub(crate) async fn offset_commit(
        &mut self,
        mut request: OffsetCommitRequest,
    ) -> Result<OffsetCommitResponse> {
        let group = match (&request.group, self.config.consumer_group.name()) {
            (Some(group), _) => group.clone(),
            (None, Some(group)) => group.to_string(),
            (None, None) => return Err(SessionError::group_required("offset_commit")),
        };

        let target = if self.config.consumer_group.is_group() {
            self.resolve_coordinator_with_fallback(true).await?
        } else {
            self.bootstrap_broker()
        };
        let target = target.ok_or(SessionError::NoBrokersAvailable)?;

        debug!(
            "Committing offset {} for {}:{} (group {}) to {}",
            request.offset, request.topic, request.partition, group, target
        );
        request.group = Some(group);

        let response: OffsetCommitResponse = self
            .send_to(&target, Request::OffsetCommit(request))
            .await?;

        let error_code = response.error_code();
        if !error_code.is_ok() {
            warn!("Offset commit to {} returned {}", target, error_code);
        }
        self.observe_group_error(error_code);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::ApiKey;
    use crate::testing::*;

    #[tokio::test]
    async fn test_offset_fetch_uses_session_group() {
        let mock = MockCluster::new(|_, request| match request {
            Request::ConsumerMetadata(_) => coordinator_response(2, "b2", 9092),
            Request::OffsetFetch(_) => offset_fetch_response("t", 0, 41),
            _ => MockReply::Disconnect,
        });
        let (mut state, _commands) = mock.state(config(&["b1:9092"], Some("cg")));

        let response = state
            .offset_fetch(OffsetFetchRequest::new("t", 0))
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(response.offset("t", 0), Some(41));
        assert_eq!(state.correlation_id(), 2);

        let trips = mock.round_trips();
        assert_eq!(trips[1].broker, "b2:9092");
        match &trips[1].request {
            Request::OffsetFetch(req) => assert_eq!(req.group.as_deref(), Some("cg")),
            other => panic!("Expected offset fetch request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offset_fetch_group_override() {
        let mock = MockCluster::new(|_, request| match request {
            Request::ConsumerMetadata(_) => coordinator_response(1, "b1", 9092),
            Request::OffsetFetch(_) => offset_fetch_response("t", 0, 7),
            _ => MockReply::Disconnect,
        });
        let (mut state, _commands) = mock.state(config(&["b1:9092"], Some("cg")));

        state
            .offset_fetch(OffsetFetchRequest::new("t", 0).with_group("other"))
            .await
            .unwrap();

        let trips = mock.round_trips();
        match (&trips[0].request, &trips[1].request) {
            (Request::ConsumerMetadata(lookup), Request::OffsetFetch(req)) => {
                // coordinator is resolved for the session group
                assert_eq!(lookup.group, "cg");
                assert_eq!(req.group.as_deref(), Some("other"));
            }
            other => panic!("Unexpected round trips {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_fetch_fails_closed() {
        let mock = MockCluster::new(|_, _| coordinator_error(ErrorCode::CoordinatorNotAvailable));
        let (mut state, _commands) = mock.state(config(&["b1:9092"], Some("cg")));

        let outcome = state
            .offset_fetch(OffsetFetchRequest::new("t", 0))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::TopicNotFound);
        // increments come from discovery only
        assert_eq!(state.correlation_id(), 3);
        assert!(mock
            .round_trips()
            .iter()
            .all(|t| t.api_key == ApiKey::ConsumerMetadata));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_commit_fails_open() {
        let mock = MockCluster::new(|_, request| match request {
            Request::ConsumerMetadata(_) => coordinator_error(ErrorCode::CoordinatorNotAvailable),
            Request::OffsetCommit(_) => offset_commit_response("t", 0),
            _ => MockReply::Disconnect,
        });
        let (mut state, _commands) = mock.state(config(&["b1:9092", "b2:9092"], Some("cg")));

        let response = state
            .offset_commit(OffsetCommitRequest::new("t", 0, 10))
            .await
            .unwrap();

        assert!(response.error_code().is_ok());
        assert_eq!(state.correlation_id(), 4);

        let commit = mock.round_trips().pop().unwrap();
        assert_eq!(commit.api_key, ApiKey::OffsetCommit);
        assert_eq!(commit.broker, "b1:9092");
    }

    #[tokio::test]
    async fn test_offset_commit_without_session_group() {
        let mock = MockCluster::new(|_, _| offset_commit_response("t", 0));
        let (mut state, _commands) = mock.state(config(&["b1:9092"], None));

        let err = state
            .offset_commit(OffsetCommitRequest::new("t", 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::GroupRequired {
                operation: "offset_commit"
            }
        ));
        assert_eq!(state.correlation_id(), 0);

        // an explicit group goes straight to the bootstrap broker, no discovery
        state
            .offset_commit(OffsetCommitRequest::new("t", 0, 10).with_group("adhoc"))
            .await
            .unwrap();

        let trips = mock.round_trips();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].api_key, ApiKey::OffsetCommit);
        match &trips[0].request {
            Request::OffsetCommit(req) => {
                assert_eq!(req.group.as_deref(), Some("adhoc"));
                assert_eq!(req.offset, 10);
            }
            other => panic!("Expected offset commit request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offset_commit_not_coordinator_clears_cache() {
        let mock = MockCluster::new(|_, request| match request {
            Request::ConsumerMetadata(_) => coordinator_response(1, "b1", 9092),
            Request::OffsetCommit(_) => offset_commit_error("t", 0, ErrorCode::NotCoordinator),
            _ => MockReply::Disconnect,
        });
        let (mut state, _commands) = mock.state(config(&["b1:9092"], Some("cg")));

        let response = state
            .offset_commit(OffsetCommitRequest::new("t", 0, 3))
            .await
            .unwrap();

        assert_eq!(response.error_code(), ErrorCode::NotCoordinator);
        assert_eq!(state.consumer_group_metadata().coordinator, None);
        assert_eq!(
            state.consumer_group_metadata().error_code,
            ErrorCode::NotCoordinator
        );
    }
}
