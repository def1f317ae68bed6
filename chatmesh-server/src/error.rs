//! Error types for the replication layer.
//!
//! Transport and protocol errors never leave the link that produced them;
//! merge errors propagate to whoever asked for a snapshot to be applied.

use std::io;

/// Failures on a single peer link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("peer manager is not running")]
    NotRunning,
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("refusing to connect to this very node ({0})")]
    SelfConnection(String),
    #[error("connect to {addr} timed out after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures while capturing or applying a database snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// A binary column exceeded the store's size limit. Distinguished from
    /// [`SyncError::Database`] so the apply can be retried without it.
    #[error("field `{field}` too large ({size} bytes, limit {limit})")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },
}

impl SyncError {
    /// True for errors caused by an oversized field, either detected up
    /// front or reported by SQLite itself.
    pub fn is_oversized(&self) -> bool {
        match self {
            SyncError::FieldTooLarge { .. } => true,
            SyncError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::TooBig
            }
            _ => false,
        }
    }
}

/// Bad configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed peer endpoint `{0}` (expected host:port)")]
    MalformedEndpoint(String),
    #[error("invalid port in peer endpoint `{0}`")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_detection() {
        let err = SyncError::FieldTooLarge { field: "photo", size: 10, limit: 5 };
        assert!(err.is_oversized());

        let too_big = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_TOOBIG),
            None,
        );
        assert!(SyncError::Database(too_big).is_oversized());

        let other = SyncError::Database(rusqlite::Error::QueryReturnedNoRows);
        assert!(!other.is_oversized());
    }
}
