//! Error types for store submissions and the sink writer.

use thiserror::Error;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E101: Store throttled the request
    E101Throttled,
    /// E102: Store unreachable, timed out or temporarily failing
    E102Unavailable,
    /// E103: Store rejected the request in a way retries cannot fix
    E103Permanent,
    /// E201: Writer is draining, failed or closed
    E201NotAccepting,
    /// E202: Drain did not complete before its deadline
    E202DrainIncomplete,
    /// E203: Requests could not be written within the retry budget
    E203RetriesExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E101Throttled => "E101",
            Self::E102Unavailable => "E102",
            Self::E103Permanent => "E103",
            Self::E201NotAccepting => "E201",
            Self::E202DrainIncomplete => "E202",
            Self::E203RetriesExhausted => "E203",
        }
    }
}

/// Failure of a single submit call against a store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("[{code}] Store throttled the request: {message}")]
    Throttled { code: &'static str, message: String },

    #[error("[{code}] Store unavailable: {message}")]
    Unavailable { code: &'static str, message: String },

    #[error("[{code}] Store rejected the request: {message}")]
    Permanent { code: &'static str, message: String },
}

impl StoreError {
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            code: ErrorCode::E101Throttled.as_str(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            code: ErrorCode::E102Unavailable.as_str(),
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            code: ErrorCode::E103Permanent.as_str(),
            message: message.into(),
        }
    }

    /// Whether resubmitting the same batch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Unavailable { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Throttled { .. } => ErrorCode::E101Throttled,
            Self::Unavailable { .. } => ErrorCode::E102Unavailable,
            Self::Permanent { .. } => ErrorCode::E103Permanent,
        }
    }
}

/// Errors surfaced by [`crate::SinkWriter`].
///
/// Fatal errors are recorded on the writer and returned from every later
/// call, hence `Clone`.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("[E201] Writer is not accepting records (state: {state})")]
    NotAccepting { state: crate::WriterState },

    #[error("[E202] Drain incomplete: {buffered} buffered and {in_flight} in-flight requests remain")]
    DrainIncomplete { buffered: usize, in_flight: usize },

    #[error("[E203] {count} write request(s) could not be written: {reason}")]
    RetriesExhausted { count: usize, reason: String },
}

impl SinkError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotAccepting { .. } => ErrorCode::E201NotAccepting,
            Self::DrainIncomplete { .. } => ErrorCode::E202DrainIncomplete,
            Self::RetriesExhausted { .. } => ErrorCode::E203RetriesExhausted,
        }
    }

    /// Fatal errors stop the writer for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// Result type alias for StoreError
pub type Result<T> = std::result::Result<T, StoreError>;
