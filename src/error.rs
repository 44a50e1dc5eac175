use serde::Serialize;
use thiserror::Error;

use crate::attack::AttackError;
use crate::codec::CodecError;
use crate::fsprng::KeyError;
use crate::hashchain::IndexError;
use crate::header::FormatError;
use crate::seal::SealError;
use crate::view::ViewError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    View(#[from] ViewError),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Seal error: {0}")]
    Seal(#[from] SealError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Attack aborted: {0}")]
    Attack(#[from] AttackError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What an error says about the file (or about this tool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Not a well-formed journal file.
    Corrupt,
    /// Well-formed, but the indexes disagree with each other.
    Inconsistent,
    /// The seal rejects the content.
    Resisted,
    /// The inputs do not allow the requested operation.
    Precondition,
    /// This tool produced something it cannot itself accept.
    Fault,
    Io,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::View(_) | Error::Format(_) | Error::Codec(_) => ErrorCategory::Corrupt,
            Error::Index(_) => ErrorCategory::Inconsistent,
            Error::Seal(SealError::Format(_)) => ErrorCategory::Corrupt,
            Error::Seal(SealError::Key(_)) | Error::Key(_) => ErrorCategory::Precondition,
            Error::Seal(_) => ErrorCategory::Resisted,
            Error::Attack(AttackError::SelfCheckFailed(_)) => ErrorCategory::Fault,
            Error::Attack(AttackError::HashMismatch { .. }) => ErrorCategory::Corrupt,
            Error::Attack(_) => ErrorCategory::Precondition,
            Error::Io(_) => ErrorCategory::Io,
        }
    }
}
