use strum::Display;
use thiserror::Error;

/// Convenient result type for `frtool-lib`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("flashing tool `{0}` not found in PATH")]
    ToolNotFound(String),

    #[error("failed to launch flashing tool: {0}")]
    Process(String),

    #[error("no flash chip detected: {0}")]
    ChipNotFound(String),

    #[error("programmer access denied: {0}")]
    AccessDenied(String),

    #[error("verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("image is {image} bytes but the chip holds {capacity}")]
    ImageTooLarge { image: u64, capacity: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("another operation is already in progress")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("flashing tool failed: {0}")]
    Unknown(String),

    /// Failure reported by the tool's output stream whose classification has
    /// no dedicated payload shape; carries the raw diagnostic line.
    #[error("{detail}")]
    Reported { kind: ErrorKind, detail: String },
}

/// Classification of an [`Error`] without its payload. This is what travels
/// inside `ProgressEvent::Failed`, where the detail text is carried
/// separately as the raw tool output.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ToolNotFound,
    Process,
    ChipNotFound,
    AccessDenied,
    VerificationMismatch,
    ImageTooLarge,
    InvalidArgument,
    Io,
    Busy,
    Cancelled,
    Unknown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Error::Process(_) => ErrorKind::Process,
            Error::ChipNotFound(_) => ErrorKind::ChipNotFound,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::VerificationMismatch(_) => ErrorKind::VerificationMismatch,
            Error::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io(_) => ErrorKind::Io,
            Error::Busy => ErrorKind::Busy,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Unknown(_) => ErrorKind::Unknown,
            Error::Reported { kind, .. } => *kind,
        }
    }

    /// Rebuild an error from a classified kind plus the raw diagnostic text,
    /// as reported by the tool's output stream.
    pub fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::ToolNotFound => Error::ToolNotFound(detail),
            ErrorKind::Process => Error::Process(detail),
            ErrorKind::ChipNotFound => Error::ChipNotFound(detail),
            ErrorKind::AccessDenied => Error::AccessDenied(detail),
            ErrorKind::VerificationMismatch => Error::VerificationMismatch(detail),
            ErrorKind::ImageTooLarge => Error::Reported { kind, detail },
            ErrorKind::InvalidArgument => Error::InvalidArgument(detail),
            ErrorKind::Io => Error::Io(std::io::Error::other(detail)),
            ErrorKind::Busy => Error::Busy,
            ErrorKind::Cancelled => Error::Cancelled,
            ErrorKind::Unknown => Error::Unknown(detail),
        }
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_kind_preserves_the_classification() {
        let kinds = [
            ErrorKind::ToolNotFound,
            ErrorKind::Process,
            ErrorKind::ChipNotFound,
            ErrorKind::AccessDenied,
            ErrorKind::VerificationMismatch,
            ErrorKind::ImageTooLarge,
            ErrorKind::InvalidArgument,
            ErrorKind::Io,
            ErrorKind::Busy,
            ErrorKind::Cancelled,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            let err = Error::from_kind(kind, "raw tool line");
            assert_eq!(err.kind(), kind, "kind {kind} did not survive");
        }
    }
}
