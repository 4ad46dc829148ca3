//! Consumer group coordinator discovery and membership round trips

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cluster::BrokerId;
use crate::error::ErrorCode;
use crate::protocol::{
    ConsumerMetadataRequest, ConsumerMetadataResponse, GroupProtocol, HeartbeatRequest,
    HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, MemberAssignment, Request, SyncGroupRequest, SyncGroupResponse,
    TopicName, CONSUMER_PROTOCOL_NAME, CONSUMER_PROTOCOL_TYPE,
};
use crate::session::{duration_ms, Outcome, SessionState};
use crate::Result;

/// Cached coordinator of the session's consumer group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerGroupMetadata {
    /// Coordinator broker, `None` until discovery succeeds
    pub coordinator: Option<BrokerId>,
    /// Error code of the last discovery, [`ErrorCode::None`] on success
    pub error_code: ErrorCode,
}

impl SessionState {
    /// Rediscover the group coordinator, replacing the cached one.
    ///
    /// Runs up to `coordinator_retry.max_attempts` attempts with a fixed
    /// backoff between failures. Exhausting the budget is not an error: the
    /// cache is left without a coordinator and the last error code.
    pub(crate) async fn update_consumer_metadata(&mut self) -> Result<ConsumerGroupMetadata> {
        self.discover_coordinator(true).await
    }

    pub(crate) async fn discover_coordinator(
        &mut self,
        report_failure: bool,
    ) -> Result<ConsumerGroupMetadata> {
        let group = self
            .config
            .consumer_group
            .require("update_consumer_metadata")?
            .to_string();
        let max_attempts = self.config.coordinator_retry.max_attempts;
        let backoff = self.config.coordinator_retry.backoff;

        let mut error_code = ErrorCode::CoordinatorNotAvailable;
        for attempt in 1..=max_attempts {
            match self.coordinator_attempt(&group).await {
                Ok(coordinator) => {
                    debug!("Coordinator for group {} is {}", group, coordinator);
                    self.consumer_group = ConsumerGroupMetadata {
                        coordinator: Some(coordinator),
                        error_code: ErrorCode::None,
                    };
                    return Ok(self.consumer_group.clone());
                }
                Err(code) => error_code = code,
            }

            if attempt < max_attempts {
                debug!(
                    "Coordinator lookup for group {} failed with {} (attempt {}/{}), retrying in {:?}",
                    group, error_code, attempt, max_attempts, backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }

        if report_failure {
            error!(
                "Unable to find coordinator for group {} after {} attempts: {}",
                group, max_attempts, error_code
            );
        } else {
            debug!(
                "Background coordinator refresh for group {} failed: {}",
                group, error_code
            );
        }

        self.consumer_group = ConsumerGroupMetadata {
            coordinator: None,
            error_code,
        };
        Ok(self.consumer_group.clone())
    }

    /// One discovery attempt: ask the known brokers in order until one answers.
    /// The whole walk shares a single correlation id.
    async fn coordinator_attempt(&mut self, group: &str) -> std::result::Result<BrokerId, ErrorCode> {
        let candidates: Vec<BrokerId> = self.brokers.iter().map(|b| b.id.clone()).collect();
        if candidates.is_empty() {
            return Err(ErrorCode::CoordinatorNotAvailable);
        }
        let correlation_id = self.next_correlation_id();

        for broker in candidates {
            let request = Request::ConsumerMetadata(ConsumerMetadataRequest {
                group: group.to_string(),
            });

            let response: ConsumerMetadataResponse = match self
                .send_with_id(&broker, request, correlation_id)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("Coordinator lookup on {} failed: {}", broker, e);
                    continue;
                }
            };

            if !response.error_code.is_ok() {
                return Err(response.error_code);
            }

            let port = u16::try_from(response.port).map_err(|_| {
                warn!(
                    "Coordinator {} reported invalid port {}",
                    response.coordinator_id, response.port
                );
                ErrorCode::CoordinatorNotAvailable
            })?;

            return self
                .register_broker(&response.host, port, Some(response.coordinator_id))
                .map_err(|e| {
                    warn!("Unable to connect to coordinator {}: {}", response.host, e);
                    ErrorCode::CoordinatorNotAvailable
                });
        }

        Err(ErrorCode::CoordinatorNotAvailable)
    }

    /// Cached coordinator, discovering it when the cache is empty
    pub(crate) async fn resolve_coordinator(&mut self) -> Result<Option<BrokerId>> {
        self.config.consumer_group.require("resolve_coordinator")?;

        if let Some(coordinator) = &self.consumer_group.coordinator {
            return Ok(Some(coordinator.clone()));
        }

        Ok(self.update_consumer_metadata().await?.coordinator)
    }

    /// [`Self::resolve_coordinator`], optionally falling back to the bootstrap
    /// broker when no coordinator can be found
    pub(crate) async fn resolve_coordinator_with_fallback(
        &mut self,
        use_first_as_default: bool,
    ) -> Result<Option<BrokerId>> {
        match self.resolve_coordinator().await? {
            Some(coordinator) => Ok(Some(coordinator)),
            None if use_first_as_default => {
                let fallback = self.bootstrap_broker();
                if let Some(broker) = &fallback {
                    info!("No coordinator found, falling back to {}", broker);
                }
                Ok(fallback)
            }
            None => Ok(None),
        }
    }

    /// Coordinator for a membership round trip; logs when there is none
    pub(crate) async fn coordinator_for(&mut self, operation: &str) -> Result<Option<BrokerId>> {
        let coordinator = self.resolve_coordinator_with_fallback(false).await?;
        if coordinator.is_none() {
            error!(
                "{} failed: no coordinator available for group {} ({})",
                operation, self.config.consumer_group, self.consumer_group.error_code
            );
        }
        Ok(coordinator)
    }

    /// Drop the cached coordinator when a response says it moved
    pub(crate) fn observe_group_error(&mut self, error_code: ErrorCode) {
        if error_code.is_coordinator_error() {
            if let Some(coordinator) = self.consumer_group.coordinator.take() {
                info!(
                    "Coordinator {} rejected group request with {}, will rediscover",
                    coordinator, error_code
                );
            }
            self.consumer_group.error_code = error_code;
        }
    }

    pub(crate) async fn join_group(
        &mut self,
        topics: Vec<TopicName>,
        session_timeout: Duration,
    ) -> Result<Outcome<JoinGroupResponse>> {
        let group = self.config.consumer_group.require("join_group")?.to_string();
        let Some(coordinator) = self.coordinator_for("join_group").await? else {
            return Ok(Outcome::TopicNotFound);
        };

        let request = Request::JoinGroup(JoinGroupRequest {
            group,
            session_timeout_ms: duration_ms(session_timeout),
            member_id: String::new(),
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
            protocols: vec![GroupProtocol {
                name: CONSUMER_PROTOCOL_NAME.to_string(),
                topics,
            }],
        });

        let response: JoinGroupResponse = self.send_to(&coordinator, request).await?;
        self.observe_group_error(response.error_code);
        Ok(Outcome::Completed(response))
    }

    pub(crate) async fn sync_group(
        &mut self,
        group: String,
        generation_id: i32,
        member_id: String,
        assignments: Vec<MemberAssignment>,
    ) -> Result<Outcome<SyncGroupResponse>> {
        self.config.consumer_group.require("sync_group")?;
        let Some(coordinator) = self.coordinator_for("sync_group").await? else {
            return Ok(Outcome::TopicNotFound);
        };

        let request = Request::SyncGroup(SyncGroupRequest {
            group,
            generation_id,
            member_id,
            assignments,
        });

        let response: SyncGroupResponse = self.send_to(&coordinator, request).await?;
        self.observe_group_error(response.error_code);
        Ok(Outcome::Completed(response))
    }

    pub(crate) async fn heartbeat(
        &mut self,
        group: String,
        generation_id: i32,
        member_id: String,
    ) -> Result<Outcome<HeartbeatResponse>> {
        self.config.consumer_group.require("heartbeat")?;
        let Some(coordinator) = self.coordinator_for("heartbeat").await? else {
            return Ok(Outcome::TopicNotFound);
        };

        let request = Request::Heartbeat(HeartbeatRequest {
            group,
            generation_id,
            member_id,
        });

        let response: HeartbeatResponse = self.send_to(&coordinator, request).await?;
        self.observe_group_error(response.error_code);
        Ok(Outcome::Completed(response))
    }

    pub(crate) async fn leave_group(
        &mut self,
        group: String,
        member_id: String,
    ) -> Result<Outcome<LeaveGroupResponse>> {
        self.config.consumer_group.require("leave_group")?;
        let Some(coordinator) = self.coordinator_for("leave_group").await? else {
            return Ok(Outcome::TopicNotFound);
        };

        let request = Request::LeaveGroup(LeaveGroupRequest { group, member_id });

        let response: LeaveGroupResponse = self.send_to(&coordinator, request).await?;
        self.observe_group_error(response.error_code);
        Ok(Outcome::Completed(response))
    }
}
