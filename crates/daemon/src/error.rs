//! Maps engine/storage failures onto the wire's `ERROR_*` taxonomy.

use chunksnap_primitives::ErrorCode;

/// A failure the dispatcher can turn into a `*_ERROR` reply without
/// closing the client, as opposed to a protocol violation (unknown code,
/// truncated body) which does close it.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<chunksnap_storage::Error> for RequestError {
    fn from(e: chunksnap_storage::Error) -> Self {
        use chunksnap_storage::Error as E;
        let code = match &e {
            E::Io(_) => ErrorCode::Io,
            E::OutOfSpace { .. } => ErrorCode::OutOfSpace,
            E::UnknownSnapshot(_) | E::SnapshotExists(_) | E::TooManySnapshots(_) => ErrorCode::InvalidSnapshot,
            E::BadMagic | E::BadVersion { .. } | E::Journal(_) | E::LeafFull { .. } | E::CorruptLeaf { .. } | E::CorruptNode { .. } => {
                ErrorCode::Io
            }
        };
        RequestError::new(code, e.to_string())
    }
}
