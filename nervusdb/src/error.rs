use nervusdb_storage::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure surface of a [`Database`](crate::Database) handle.
///
/// Kernel errors are folded through their coarse taxonomy so embedders
/// can branch on what happened without naming internal variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request itself was malformed: bad depth range, unknown node
    /// id, batch misuse, maintenance on a read-only handle.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Another process holds the exclusive write lock.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// On-disk state failed verification; `check` and `repair` apply.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A user-supplied predicate or callback failed.
    #[error("callback failed: {0}")]
    Callback(String),

    /// Anything else the storage or query layer reports.
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<nervusdb_storage::Error> for Error {
    fn from(e: nervusdb_storage::Error) -> Self {
        match e {
            nervusdb_storage::Error::Io(io) => Error::Io(io),
            other => {
                let message = other.to_string();
                match other.kind() {
                    ErrorKind::InvalidArgument => Error::InvalidRequest(message),
                    ErrorKind::Conflict => Error::WriteConflict(message),
                    ErrorKind::Corruption => Error::Corruption(message),
                    ErrorKind::Callback => Error::Callback(message),
                    ErrorKind::Internal | ErrorKind::Io => Error::Engine(message),
                }
            }
        }
    }
}

impl From<nervusdb_query::Error> for Error {
    fn from(e: nervusdb_query::Error) -> Self {
        match e {
            nervusdb_query::Error::InvalidArgument(message) => Error::InvalidRequest(message),
            other => Error::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn lock_contention_maps_to_write_conflict() {
        let inner = nervusdb_storage::Error::LockHeld {
            path: PathBuf::from("graph.synapse.lock"),
        };
        assert!(matches!(Error::from(inner), Error::WriteConflict(_)));
    }

    #[test]
    fn crc_failures_map_to_corruption() {
        let inner = nervusdb_storage::Error::PageCrcMismatch {
            order: nervusdb_api::IndexOrder::Spo,
            page_id: 7,
        };
        assert!(matches!(Error::from(inner), Error::Corruption(_)));
    }

    #[test]
    fn io_errors_keep_their_source() {
        let inner = nervusdb_storage::Error::Io(std::io::Error::other("disk gone"));
        let err = Error::from(inner);
        assert!(matches!(err, Error::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn bad_query_input_maps_to_invalid_request() {
        let inner = nervusdb_query::Error::InvalidArgument("depth range".to_string());
        assert!(matches!(Error::from(inner), Error::InvalidRequest(_)));
    }
}
