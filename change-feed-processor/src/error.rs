use thiserror::Error;

/// Substatus codes reported by the monitored data source alongside an HTTP-like
/// status. Only the ones the processor reacts to are named.
pub mod substatus {
    pub const PARTITION_KEY_RANGE_GONE: u16 = 1002;
    pub const READ_SESSION_NOT_AVAILABLE: u16 = 1002;
    pub const COMPLETING_SPLIT: u16 = 1007;
    pub const COMPLETING_PARTITION_MIGRATION: u16 = 1008;
}

#[derive(Error, Debug)]
pub enum Error {
    /// Ownership precondition failed: the lease was stolen, expired or deleted.
    #[error("lease lost for partition {0}")]
    LeaseLost(String),

    /// The monitored partition no longer exists (it was split). Carries the
    /// last continuation the reader observed so children can resume from it.
    #[error("partition {partition} is gone")]
    PartitionGone {
        partition: String,
        continuation: Option<String>,
    },

    #[error("monitored feed not found: {0}")]
    FeedNotFound(String),

    #[error("read session not available: {0}")]
    ReadSessionNotAvailable(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("observer failed for partition {partition}: {reason}")]
    Observer { partition: String, reason: String },

    /// Topology reports a split but no child range is visible.
    #[error("partition {0} is gone but no child ranges were found")]
    SplitWithoutChildren(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("precondition failed for key {0}")]
    PreconditionFailed(String),

    #[error("conflict on key {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("continuation token version {0} is newer than this processor understands")]
    TokenFromTheFuture(u32),

    #[error("malformed continuation token: {0}")]
    MalformedContinuation(String),

    #[error("status {status}/{substatus}: {message}")]
    Status {
        status: u16,
        substatus: u16,
        message: String,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error(transparent)]
    Config(#[from] envconfig::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Map a status/substatus pair reported by the data source to an error kind.
    pub fn from_status(status: u16, substatus: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match (status, substatus) {
            (404, 0) => Self::FeedNotFound(message),
            (404, substatus::READ_SESSION_NOT_AVAILABLE) => Self::ReadSessionNotAvailable(message),
            (
                410,
                substatus::PARTITION_KEY_RANGE_GONE
                | substatus::COMPLETING_SPLIT
                | substatus::COMPLETING_PARTITION_MIGRATION,
            ) => Self::PartitionGone {
                partition: message,
                continuation: None,
            },
            (412, _) => Self::PreconditionFailed(message),
            (409, _) => Self::Conflict(message),
            (429, _) => Self::Throttled(message),
            _ => Self::Status {
                status,
                substatus,
                message,
            },
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost(_))
    }

    pub fn is_partition_gone(&self) -> bool {
        matches!(self, Self::PartitionGone { .. })
    }

    /// Errors worth retrying after a short wait rather than tearing the
    /// partition down.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Throttled(_) | Self::ReadSessionNotAvailable(_) | Self::Etcd(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
