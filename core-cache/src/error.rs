//! # Cache Error Types
//!
//! Every failure the cache can surface, with the numeric codes hosts already
//! match on.

use bridge_traits::BridgeError;
use thiserror::Error;

/// Broad category of a [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// Bad input from the caller
    Validation,
    /// Disk or metadata problem
    Storage,
    /// Transport failure or unexpected response
    Network,
    /// Refused by a cache policy such as the free-space reserve
    Policy,
    /// Stopped on request
    Canceled,
}

/// Errors that can occur during cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// Keys must be non-empty.
    #[error("Cache key is empty")]
    EmptyKey,

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// The resource reported a different length than the one already cached.
    #[error("Length mismatch for {key}: cached {cached}, server reports {reported}")]
    LengthMismatch {
        key: String,
        cached: u64,
        reported: u64,
    },

    // ========================================================================
    // Storage Errors
    // ========================================================================
    /// The requested bytes are not fully cached.
    #[error("Range {offset}+{length} of {key} is not cached")]
    NotFound {
        key: String,
        offset: u64,
        length: u64,
    },

    #[error("No metadata for {0}")]
    MetaNotFound(String),

    /// Metadata claims bytes whose data file is gone.
    #[error("Data file for {0} does not exist")]
    DataFileMissing(String),

    #[error("Failed to create cache file: {0}")]
    CreateFileFailed(String),

    #[error("Failed to write cache data: {0}")]
    WriteFailed(String),

    #[error("Failed to read cache data: {0}")]
    ReadFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Network Errors
    // ========================================================================
    #[error("Network error: {0}")]
    Network(String),

    /// Any status other than 200/206.
    #[error("Unexpected response {status} from {url}")]
    BadResponse { status: u16, url: String },

    /// The body ended before the requested bytes arrived.
    #[error("Response body ended at {received} of {expected} bytes")]
    IncompleteBody { expected: u64, received: u64 },

    // ========================================================================
    // Policy Errors
    // ========================================================================
    #[error("Insufficient disk space: {available} bytes free, {required} required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    #[error("Operation canceled")]
    Canceled,

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// Host bridge failure other than transport
    #[error("Bridge error: {0}")]
    Bridge(BridgeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BridgeError> for CacheError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Transport(message) => CacheError::Network(message),
            BridgeError::Io(e) => CacheError::Io(e),
            other => CacheError::Bridge(other),
        }
    }
}

impl CacheError {
    /// Numeric code compatible with the codes hosts already log.
    pub fn code(&self) -> i32 {
        match self {
            CacheError::BadResponse { .. } => 5005,
            CacheError::Network(_) | CacheError::IncompleteBody { .. } => 5000,
            CacheError::EmptyKey => 6003,
            CacheError::InvalidRange(_) | CacheError::LengthMismatch { .. } => 6000,
            CacheError::CreateFileFailed(_) => 6001,
            CacheError::MetaNotFound(_) => 6002,
            CacheError::DataFileMissing(_) => 6004,
            CacheError::WriteFailed(_) => 6006,
            CacheError::NotFound { .. } => 6008,
            CacheError::ReadFailed(_) | CacheError::Io(_) => 6009,
            CacheError::InsufficientDiskSpace { .. } => 6100,
            CacheError::Canceled => 6200,
            CacheError::Bridge(_) | CacheError::Internal(_) => 6999,
        }
    }

    pub fn kind(&self) -> CacheErrorKind {
        match self {
            CacheError::EmptyKey
            | CacheError::InvalidRange(_)
            | CacheError::LengthMismatch { .. } => CacheErrorKind::Validation,
            CacheError::Network(_)
            | CacheError::BadResponse { .. }
            | CacheError::IncompleteBody { .. } => CacheErrorKind::Network,
            CacheError::InsufficientDiskSpace { .. } => CacheErrorKind::Policy,
            CacheError::Canceled => CacheErrorKind::Canceled,
            _ => CacheErrorKind::Storage,
        }
    }

    /// Returns `true` if this error is due to network issues.
    pub fn is_network_error(&self) -> bool {
        self.kind() == CacheErrorKind::Network
    }

    pub fn is_storage_error(&self) -> bool {
        self.kind() == CacheErrorKind::Storage
    }

    pub fn is_policy_error(&self) -> bool {
        self.kind() == CacheErrorKind::Policy
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, CacheError::Canceled)
    }

    /// Returns `true` if retrying the same operation later may succeed.
    ///
    /// The cache never retries on its own; this is a hint for the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Network(_)
            | CacheError::IncompleteBody { .. }
            | CacheError::InsufficientDiskSpace { .. } => true,
            CacheError::BadResponse { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
