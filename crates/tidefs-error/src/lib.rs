#![forbid(unsafe_code)]
//! Error types for tidefs.
//!
//! Defines `TideError` and a `Result<T>` alias used throughout the workspace,
//! with errno mappings for a future VFS adapter.

use thiserror::Error;
use tidefs_types::ParseError;

/// Unified error type for all tidefs operations.
#[derive(Debug, Error)]
pub enum TideError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("stale block reference at block {block}")]
    Stale { block: u64 },

    #[error("no space left on device")]
    NoSpace,

    #[error("not found")]
    NotFound,

    #[error("item exists")]
    Exists,

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

impl TideError {
    /// Build a corruption error for a block with a static description.
    #[must_use]
    pub fn corrupt(block: u64, detail: &str) -> Self {
        Self::Corruption {
            block,
            detail: detail.to_owned(),
        }
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Parse(_) => libc::EIO,
            Self::Stale { .. } => libc::ESTALE,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::Invalid(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `TideError`.
pub type Result<T> = std::result::Result<T, TideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(TideError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(TideError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(TideError::corrupt(7, "bad header").to_errno(), libc::EIO);
        assert_eq!(TideError::Invalid("order").to_errno(), libc::EINVAL);
        assert_eq!(TideError::Stale { block: 3 }.to_errno(), libc::ESTALE);
    }

    #[test]
    fn corruption_formats_block() {
        let err = TideError::corrupt(42, "missing ref");
        assert_eq!(err.to_string(), "corrupt metadata at block 42: missing ref");
    }
}
