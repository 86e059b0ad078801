#![forbid(unsafe_code)]
//! Error types for fsprobe.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fsp-types` | On-disk format violations found while decoding bytes |
//! | Runtime | `FspError` | `fsp-error` (this crate) | Errors returned by discovery, the control surface and the CLI |
//!
//! `fsp-error` does not depend on `fsp-types`. The conversion from
//! `ParseError` to `FspError` lives in `fsp-core`: a parse failure during
//! discovery becomes `Format` or `InvalidGeometry`; a parse failure while
//! reading live metadata (resolving a fault refinement) becomes `Corruption`
//! carrying the block number.
//!
//! Classification never returns an error. A block whose header cannot be
//! decoded degrades to the `Unknown` role and observation continues.
//!
//! ## Control-surface errno mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format`, `Parse`, `InvalidGeometry`, `Config` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `JournalNotFound` | `ENOENT` |
//! | `FaultAlreadyQueued`, `AlreadyObserving` | `EBUSY` |
//! | `NoFaultQueued` | `ENOENT` |
//! | `FilesystemMismatch` | `EINVAL` |
//! | `NotObserving` | `ENODEV` |
//! | `RequestFailed`, `Crashed` | `EIO` |

use thiserror::Error;

/// Unified error type for fsprobe operations.
#[derive(Debug, Error)]
pub enum FspError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata read while observing could not be decoded.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not the filesystem variant it was declared to be.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock geometry out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The filesystem advertises no usable journal.
    #[error("journal not found: {0}")]
    JournalNotFound(String),

    /// A fault is already pending; only one may be queued at a time.
    #[error("a fault is already queued")]
    FaultAlreadyQueued,

    #[error("no fault is queued")]
    NoFaultQueued,

    /// The fault targets a different filesystem variant than the observed one.
    #[error("fault targets {requested} but the observed filesystem is {observed}")]
    FilesystemMismatch { observed: String, requested: String },

    #[error("observation has not been started")]
    NotObserving,

    #[error("observation already started")]
    AlreadyObserving,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A storage request completed with an error (device failure or injected fault).
    #[error("request {request} failed: {detail}")]
    RequestFailed { request: u64, detail: String },

    /// The emulated system has crashed; every request fails until cleared.
    #[error("system crashed after commit; request rejected")]
    Crashed,
}

impl FspError {
    /// Convert this error into a POSIX errno for ioctl-style control callers.
    ///
    /// The mapping is exhaustive, so a new variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::RequestFailed { .. } | Self::Crashed => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::Config(_)
            | Self::FilesystemMismatch { .. } => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::JournalNotFound(_) | Self::NoFaultQueued => libc::ENOENT,
            Self::FaultAlreadyQueued | Self::AlreadyObserving => libc::EBUSY,
            Self::NotObserving => libc::ENODEV,
        }
    }
}

/// Result alias using `FspError`.
pub type Result<T> = std::result::Result<T, FspError>;
