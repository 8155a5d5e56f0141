use thiserror::Error;

/// Failures that abort a whole analysis run.
///
/// The boundary surfaces these by category; detector failures are handled
/// separately (see [DetectorError]) and never reach this enum.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Rejected before parsing: bad extension, empty upload, or an upload
    /// breaching the configured resource ceilings.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The byte stream is not a recognizable capture container.
    #[error("unrecognized capture format: {0}")]
    CaptureFormat(String),

    /// A declared frame length exceeds the bytes remaining in the stream.
    #[error("truncated capture: {0}")]
    CaptureTruncated(String),

    /// The capture-parsing capability is absent from this build.
    #[error("capture parsing unavailable: {0}")]
    DependencyUnavailable(String),

    /// The initiating request was aborted mid-parse.
    #[error("analysis cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// A failure inside a single detector. Isolated per detector: the failing
/// detector contributes no alerts and the rest of the run proceeds.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("reputation collaborator unreachable: {0}")]
    Reputation(String),

    #[error("{0}")]
    Internal(String),
}
