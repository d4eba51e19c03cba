//! Error types shared across the storage and shop layers.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::document::Status;

/// Failures raised while reading or persisting a snapshot file.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File or directory that was being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The snapshot could not be serialised.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    /// The snapshot on disk is not a valid document.
    #[error("failed to decode {path}: {source}")]
    Decode {
        /// Snapshot that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// An optimistic write was based on a stale revision.
    #[error("revision conflict: document is based on {expected}, store is at {found}")]
    Conflict {
        /// Revision the caller read.
        expected: u64,
        /// Revision currently persisted.
        found: u64,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the snapshot simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Domain failures raised by shop operations. Nothing is persisted when one
/// of these is returned.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ShopError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("user {0} is blocked")]
    Blocked(i64),
    #[error("unknown location {0}")]
    UnknownLocation(String),
    #[error("location {0} is disabled")]
    LocationDisabled(String),
    #[error("sales are currently disabled")]
    ServersDisabled,
    #[error("no network ranges configured for {0}")]
    NoRanges(String),
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: i64, available: i64 },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("amount is out of range")]
    Overflow,
    #[error("unknown discount code {0}")]
    UnknownDiscount(String),
    #[error("discount code {0} has expired")]
    DiscountExpired(String),
    #[error("discount code {0} has reached its usage limit")]
    DiscountExhausted(String),
    #[error("discount code {0} already exists")]
    DuplicateDiscount(String),
    #[error("invalid discount value {0}")]
    InvalidDiscount(i64),
    #[error("invalid referral code {0}")]
    InvalidReferral(String),
    #[error("user {0} was already referred")]
    AlreadyReferred(i64),
    #[error("unknown payment request {0}")]
    UnknownPayment(String),
    #[error("payment request {id} is already {status:?}")]
    AlreadyDecided { id: String, status: Status },
    #[error("unknown ticket {0}")]
    UnknownTicket(String),
    #[error("ticket {0} is closed")]
    TicketClosed(String),
    #[error("message text is empty")]
    EmptyMessage,
    #[error("unknown file {0}")]
    UnknownFile(String),
    #[error("unknown tutorial category {0}")]
    UnknownTutorial(String),
}
