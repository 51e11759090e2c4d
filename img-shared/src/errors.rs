//! Error taxonomy for snapshot, identity and execution failures.
//!
//! Variants are grouped by the layer that produces them:
//! - snapshot graph: [`ImgError::NotFound`], [`ImgError::AlreadyExists`],
//!   [`ImgError::HasChildren`], [`ImgError::InvalidState`]
//! - metadata store: [`ImgError::TransactionFailed`]
//! - mounts and identity: [`ImgError::MountFailed`], [`ImgError::Identity`]
//! - execution: [`ImgError::SpecBuild`], [`ImgError::ExecutionFailed`],
//!   [`ImgError::Cancelled`]

use std::fmt;

use thiserror::Error;

pub type ImgResult<T> = Result<T, ImgError>;

#[derive(Debug, Error)]
pub enum ImgError {
    /// Unknown snapshot key or parent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key collision on prepare, view or commit.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Remove blocked because other snapshots still reference this one.
    #[error("in use: {0}")]
    HasChildren(String),

    /// The snapshot exists but is the wrong kind for the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Metadata store I/O or consistency failure.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// OS mount or unmount error.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// No usable subordinate id ranges, or the host identity database is unreadable.
    #[error("identity: {0}")]
    Identity(String),

    /// User resolution or spec serialization failure.
    #[error("building runtime spec failed: {0}")]
    SpecBuild(String),

    /// Container runtime exited non-zero.
    #[error("exit code {code}")]
    ExecutionFailed { code: i32 },

    /// The caller cancelled the step; `code` is what the runtime reported.
    #[error("exit code {code}: operation cancelled")]
    Cancelled { code: i32 },

    /// Filesystem errors outside the metadata store.
    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ImgError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ImgError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImgError::Cancelled { .. })
    }

    /// Prefix the message with `"{ctx}: "`, keeping the variant.
    ///
    /// Exit-code variants carry no message and are returned unchanged.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        let wrap = |msg: String| format!("{}: {}", ctx, msg);
        match self {
            ImgError::NotFound(m) => ImgError::NotFound(wrap(m)),
            ImgError::AlreadyExists(m) => ImgError::AlreadyExists(wrap(m)),
            ImgError::HasChildren(m) => ImgError::HasChildren(wrap(m)),
            ImgError::InvalidState(m) => ImgError::InvalidState(wrap(m)),
            ImgError::TransactionFailed(m) => ImgError::TransactionFailed(wrap(m)),
            ImgError::MountFailed(m) => ImgError::MountFailed(wrap(m)),
            ImgError::Identity(m) => ImgError::Identity(wrap(m)),
            ImgError::SpecBuild(m) => ImgError::SpecBuild(wrap(m)),
            ImgError::Storage(m) => ImgError::Storage(wrap(m)),
            ImgError::Config(m) => ImgError::Config(wrap(m)),
            ImgError::Unsupported(m) => ImgError::Unsupported(wrap(m)),
            ImgError::Internal(m) => ImgError::Internal(wrap(m)),
            other @ (ImgError::ExecutionFailed { .. } | ImgError::Cancelled { .. }) => other,
        }
    }
}
