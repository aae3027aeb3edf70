//! Error types for the module engine and its collaborators.

use p2pcommons_meta::{
    EBusyError, InvalidKeyError, MetaError, MissingParam, TypeError, ValidationError,
};
use thiserror::Error;

/// Errors raised by drives and the drive store.
#[derive(Debug, Error)]
pub enum DriveError {
    /// A write was attempted on a drive without its secret key.
    #[error("drive {0} is not writable")]
    NotWritable(String),

    /// The requested file is not in the drive.
    #[error("file not found: {0}")]
    NotFound(String),

    /// A checkout asked for a version the drive has not reached.
    #[error("version {requested} not available (drive is at {current})")]
    VersionNotFound {
        /// Requested version.
        requested: u64,
        /// Current drive version.
        current: u64,
    },

    /// The drive handle was closed.
    #[error("drive is closed")]
    Closed,

    /// A replicated log entry failed signature verification.
    #[error("invalid signature on log entry {seq}")]
    InvalidSignature {
        /// Sequence number of the rejected entry.
        seq: u64,
    },

    /// Replicated entries do not continue the local log.
    #[error("log gap: local log ends at {local}, entries start at {from}")]
    LogGap {
        /// Local log length.
        local: u64,
        /// First sequence number offered.
        from: u64,
    },

    /// Secret key material is malformed or does not match the drive.
    #[error("key error: {0}")]
    Key(String),

    /// Log frame (de)serialization failed.
    #[error("log encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the swarm networker.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The networker was closed.
    #[error("swarm is closed")]
    Closed,

    /// Replication into a local drive failed.
    #[error(transparent)]
    Drive(#[from] DriveError),
}

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum SdkError {
    /// A metadata rule was violated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A parameter had the wrong shape.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// An update named a field that cannot be set.
    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),

    /// A required parameter was missing.
    #[error(transparent)]
    MissingParam(#[from] MissingParam),

    /// A resource was busy.
    #[error(transparent)]
    Busy(#[from] EBusyError),

    /// The local index failed.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// The module is read-only on this peer.
    #[error("module {key} is not writable")]
    NotWritable {
        /// Hex module key.
        key: String,
    },

    /// The module is not in the local index.
    #[error("module {key} not found")]
    NotFound {
        /// Hex module key.
        key: String,
    },

    /// Deregistering content the profile does not list.
    #[error("content {content} is not registered in profile {profile}")]
    NotRegistered {
        /// Content reference.
        content: String,
        /// Hex profile key.
        profile: String,
    },

    /// Unfollowing a profile that is not followed.
    #[error("profile {profile} does not follow {target}")]
    NotFollowing {
        /// Target reference.
        target: String,
        /// Hex profile key.
        profile: String,
    },

    /// A module could not be fetched from the swarm.
    #[error("{context}: {message}")]
    Fetch {
        /// Operation that was fetching.
        context: String,
        /// Last underlying failure.
        message: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A drive failed.
    #[error(transparent)]
    Drive(#[from] DriveError),

    /// The swarm failed.
    #[error(transparent)]
    Swarm(#[from] SwarmError),

    /// Settings or engine configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// A module file is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SdkError {
    /// Stable discriminant callers can branch on.
    ///
    /// Validation errors report their rule code (`title_length`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            SdkError::Validation(e) => e.code.as_str(),
            SdkError::Type(_) => "type_error",
            SdkError::InvalidKey(_) => "invalid_key",
            SdkError::MissingParam(_) => "missing_param",
            SdkError::Busy(_) => "ebusy",
            SdkError::Meta(MetaError::Codec(e)) => e.code(),
            SdkError::Meta(_) => "index_error",
            SdkError::NotWritable { .. } => "not_writable",
            SdkError::NotFound { .. } => "not_found",
            SdkError::NotRegistered { .. } => "not_registered",
            SdkError::NotFollowing { .. } => "not_following",
            SdkError::Fetch { .. } => "fetch_failed",
            SdkError::Cancelled => "cancelled",
            SdkError::Drive(_) => "drive_error",
            SdkError::Swarm(_) => "swarm_error",
            SdkError::Config(_) => "config_error",
            SdkError::Json(_) => "json_error",
            SdkError::Io(_) => "io_error",
        }
    }

    pub(crate) fn not_found(key: impl ToString) -> Self {
        SdkError::NotFound {
            key: key.to_string(),
        }
    }

    pub(crate) fn not_writable(key: impl ToString) -> Self {
        SdkError::NotWritable {
            key: key.to_string(),
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, SdkError>;
