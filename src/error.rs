use thiserror::Error;

/// Failures that surface to callers. Per-probe failures (refused, timed
/// out) and per-connection delivery failures are folded into result data
/// instead of appearing here.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Request validation: the target spec is neither a parseable address,
    /// a CIDR, nor a syntactically valid hostname. No job is created.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Request validation: unparseable port list or range. No job is created.
    #[error("invalid port spec: {0}")]
    InvalidPortSpec(String),

    /// Job setup failed after the job was created (e.g. a hostname that
    /// does not resolve). The job is marked `failed` with this message.
    #[error("scan setup failed: {0}")]
    JobStructuralFailure(String),

    /// An inbound protocol message could not be decoded. Answered with an
    /// error event; the session stays open.
    #[error("malformed message: {0}")]
    Decode(String),
}

impl ScanError {
    /// True for errors that reject the request before a job exists.
    pub fn is_validation(&self) -> bool {
        matches!(self, ScanError::InvalidTarget(_) | ScanError::InvalidPortSpec(_))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
