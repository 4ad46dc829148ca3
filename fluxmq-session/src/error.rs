//! Error types for the FluxMQ session core

/// Main error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Serialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Deserialization errors
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A group operation was issued on a session without a consumer group
    #[error("Operation '{operation}' requires a consumer group but the session has none")]
    GroupRequired { operation: &'static str },

    /// Response correlation id does not match the request
    #[error("Correlation id mismatch: expected {expected}, received {received}")]
    CorrelationMismatch { expected: i32, received: i32 },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Broker not available
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// The session actor has stopped
    #[error("Session closed")]
    SessionClosed,
}

impl SessionError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a deserialization error
    pub fn deserialization<S: Into<String>>(message: S) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    /// Create a missing consumer group error
    pub fn group_required(operation: &'static str) -> Self {
        Self::GroupRequired { operation }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::NoBrokersAvailable => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Broker error codes carried in Kafka responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error
    #[default]
    None = 0,
    /// Unknown server error
    Unknown = -1,
    /// Offset out of range
    OffsetOutOfRange = 1,
    /// Invalid message
    InvalidMessage = 2,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Invalid message size
    InvalidMessageSize = 4,
    /// Leader not available
    LeaderNotAvailable = 5,
    /// Not leader for partition
    NotLeaderForPartition = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
    /// Replica not available
    ReplicaNotAvailable = 9,
    /// Message too large
    MessageTooLarge = 10,
    /// Offset metadata too large
    OffsetMetadataTooLarge = 12,
    /// Network exception
    NetworkException = 13,
    /// Group coordinator is still loading
    CoordinatorLoadInProgress = 14,
    /// Group coordinator not available
    CoordinatorNotAvailable = 15,
    /// Broker is not the coordinator for this group
    NotCoordinator = 16,
    /// Stale generation id
    IllegalGeneration = 22,
    /// Group protocol mismatch
    InconsistentGroupProtocol = 23,
    /// Invalid group id
    InvalidGroupId = 24,
    /// Unknown member id
    UnknownMemberId = 25,
    /// Session timeout outside broker bounds
    InvalidSessionTimeout = 26,
    /// Group is rebalancing
    RebalanceInProgress = 27,
    /// Commit offset data size is not valid
    InvalidCommitOffsetSize = 28,
    /// Topic authorization failed
    TopicAuthorizationFailed = 29,
    /// Group authorization failed
    GroupAuthorizationFailed = 30,
}

impl ErrorCode {
    /// Wire representation
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// `true` for [`ErrorCode::None`]
    pub fn is_ok(self) -> bool {
        self == ErrorCode::None
    }

    /// Codes meaning the cached group coordinator can no longer be trusted
    pub fn is_coordinator_error(self) -> bool {
        matches!(
            self,
            ErrorCode::CoordinatorNotAvailable | ErrorCode::NotCoordinator
        )
    }

    /// Codes meaning the cached partition leader can no longer be trusted
    pub fn is_leader_error(self) -> bool {
        matches!(
            self,
            ErrorCode::NotLeaderForPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::UnknownTopicOrPartition
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_i16())
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            -1 => ErrorCode::Unknown,
            1 => ErrorCode::OffsetOutOfRange,
            2 => ErrorCode::InvalidMessage,
            3 => ErrorCode::UnknownTopicOrPartition,
            4 => ErrorCode::InvalidMessageSize,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            8 => ErrorCode::BrokerNotAvailable,
            9 => ErrorCode::ReplicaNotAvailable,
            10 => ErrorCode::MessageTooLarge,
            12 => ErrorCode::OffsetMetadataTooLarge,
            13 => ErrorCode::NetworkException,
            14 => ErrorCode::CoordinatorLoadInProgress,
            15 => ErrorCode::CoordinatorNotAvailable,
            16 => ErrorCode::NotCoordinator,
            22 => ErrorCode::IllegalGeneration,
            23 => ErrorCode::InconsistentGroupProtocol,
            24 => ErrorCode::InvalidGroupId,
            25 => ErrorCode::UnknownMemberId,
            26 => ErrorCode::InvalidSessionTimeout,
            27 => ErrorCode::RebalanceInProgress,
            28 => ErrorCode::InvalidCommitOffsetSize,
            29 => ErrorCode::TopicAuthorizationFailed,
            30 => ErrorCode::GroupAuthorizationFailed,
            _ => ErrorCode::Unknown,
        }
    }
}
