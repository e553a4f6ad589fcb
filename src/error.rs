//! Error types for link arbitration

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the link manager
#[derive(Error, Debug)]
pub enum Error {
    /// Link path not rooted under the device directory, escape overflow,
    /// or no relative path exists between link and node
    #[error("invalid device link path: {0}")]
    BadPath(PathBuf),

    /// A real block or character device node occupies the link path
    #[error("conflicting device node at {0}, refusing to replace it")]
    Conflict(PathBuf),

    /// Underlying system call failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unreadable device record
    #[error("invalid device record: {0}")]
    Record(#[from] serde_json::Error),

    /// The claim index holds no claimant. Internal: the link updater
    /// consumes this to mean "remove the published link".
    #[error("no claimant left for link")]
    NoClaimant,

    /// The fixpoint loop raced concurrent claim churn past its budget
    #[error("link update did not settle after {0} attempts")]
    TooManyRetries(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
