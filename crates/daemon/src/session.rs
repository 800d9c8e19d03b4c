//! One connected client: its socket, partially-read request buffer, and
//! the view (origin or a specific snapshot) it negotiated via `IDENTIFY`.

use std::collections::VecDeque;

use chunksnap_primitives::View;
use mio::net::UnixStream;

/// A session's read buffer accumulates bytes until a full `head + body`
/// message is available, since a `mio` readiness event says nothing
/// about how many bytes are actually queued.
pub struct Session {
    pub id: u64,
    pub socket: UnixStream,
    pub view: Option<View>,
    /// Snapshot tag for `view`, kept alongside for replies and usecount
    /// bookkeeping (origin sessions leave this `None`).
    pub snap_tag: Option<u32>,
    pub read_buf: Vec<u8>,
    pub write_buf: VecDeque<u8>,
    /// Origin chunks this session currently holds a snapshot-read lock
    /// on, so closing the session can release them all.
    pub held_chunks: Vec<u64>,
    pub closing: bool,
}

impl Session {
    pub fn new(id: u64, socket: UnixStream) -> Self {
        Self {
            id,
            socket,
            view: None,
            snap_tag: None,
            read_buf: Vec::new(),
            write_buf: VecDeque::new(),
            held_chunks: Vec::new(),
            closing: false,
        }
    }

    pub fn queue_write(&mut self, bytes: &[u8]) {
        self.write_buf.extend(bytes);
    }
}
