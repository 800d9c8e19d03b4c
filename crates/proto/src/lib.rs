//! Wire protocol for chunksnapd's control socket.
//!
//! Every message is `head{code: u32, length: u32}` followed by `length`
//! bytes of body, all little-endian. This crate only encodes/decodes
//! bytes; `chunksnap-daemon` owns the socket and dispatch.

mod error;
mod head;
mod message;

pub use error::{Error, Result};
pub use head::Head;
pub use message::{ChangeRange, Code, Request, Response, SnapshotEntry, WriteRange};

use chunksnap_primitives::ErrorCode;

/// Maximum body size accepted from a client, in bytes.
///
/// A fixed constant rather than a runtime config knob, since no caller
/// needs to vary it.
pub const MAX_BODY: u32 = 1 << 20;

/// `{err_code, msg}` error body shared by every `*_ERROR` reply.
#[derive(Debug, Clone)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
