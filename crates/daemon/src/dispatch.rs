//! Turns one decoded [`Request`] into a reply, threading it through the
//! engine and the snap-read lock table.
//!
//! Origin writes that land on a chunk currently locked by an in-flight
//! snapshot read cannot reply right away: their reply is parked as a
//! [`Pending`] and only handed back to the caller once every chunk they
//! touched has been released.

use std::cell::RefCell;
use std::rc::Rc;

use chunksnap_primitives::{ErrorCode, SnapshotBit, View, ORIGIN_TAG};
use chunksnap_proto::{ChangeRange, Code, ErrorBody, Request, Response, SnapshotEntry};
use chunksnap_storage::{btree, registry, Engine};

use crate::error::RequestError;
use crate::locktable::{finish_pending, LockTable, Pending};
use crate::session::Session;

/// What a dispatched request produces for its own session, plus any other
/// sessions whose parked origin-write replies just became ready to send.
pub struct DispatchResult {
    pub reply: Reply,
    pub released: Vec<Rc<RefCell<Pending>>>,
    pub shutdown: bool,
}

pub enum Reply {
    None,
    Immediate(Response),
    Deferred { pending: Rc<RefCell<Pending>>, response: Response },
}

impl DispatchResult {
    fn reply(reply: Response) -> Self {
        Self { reply: Reply::Immediate(reply), released: Vec::new(), shutdown: false }
    }

    fn none() -> Self {
        Self { reply: Reply::None, released: Vec::new(), shutdown: false }
    }
}

fn err_body(e: RequestError) -> ErrorBody {
    ErrorBody { code: e.code, message: e.message }
}

fn not_identified() -> RequestError {
    RequestError::new(ErrorCode::InvalidSnapshot, "session has not sent IDENTIFY")
}

fn protocol_error(code: Code, message: impl Into<String>) -> Response {
    Response::ProtocolError { culprit_code: code as u32, message: message.into() }
}

fn now_unix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn resolve_bit(engine: &Engine, tag: u32) -> Option<SnapshotBit> {
    if tag == ORIGIN_TAG {
        return None;
    }
    engine.sb.snapshot_by_tag(tag).map(|s| SnapshotBit(s.bit))
}

fn resolve_view(engine: &Engine, tag: u32) -> Option<View> {
    if tag == ORIGIN_TAG {
        Some(View::Origin)
    } else {
        resolve_bit(engine, tag).map(View::Snapshot)
    }
}

fn expand(ranges: &[chunksnap_proto::WriteRange]) -> impl Iterator<Item = u64> + '_ {
    ranges.iter().flat_map(|r| (0..r.chunks as u64).map(move |i| r.chunk + i))
}

fn render_status(engine: &Engine, tag_or_all: i64) -> Result<String, RequestError> {
    if tag_or_all < 0 {
        let mut out = format!(
            "metadata: {}/{} chunks used\nsnapshot-data: {}/{} chunks used\nsnapshots: {}\n",
            engine.sb.metadata_used,
            engine.sb.metadata.total_chunks,
            engine.sb.snapshot_used,
            engine.sb.snapshot_data.total_chunks,
            engine.sb.snapshots.len(),
        );
        for s in &engine.sb.snapshots {
            out.push_str(&format!(
                "  tag={} priority={} ctime={} usecount={}\n",
                s.tag, s.priority, s.ctime, s.usecount
            ));
        }
        Ok(out)
    } else {
        let tag = tag_or_all as u32;
        let s = engine
            .sb
            .snapshot_by_tag(tag)
            .ok_or_else(|| RequestError::new(ErrorCode::InvalidSnapshot, "unknown snapshot tag"))?;
        Ok(format!("tag={} priority={} ctime={} usecount={}\n", s.tag, s.priority, s.ctime, s.usecount))
    }
}

/// Handles one request from `session` against `engine`, using `locks` to
/// serialize origin writes against outstanding snapshot reads.
pub fn handle(engine: &mut Engine, locks: &mut LockTable, session: &mut Session, req: Request) -> DispatchResult {
    match req {
        Request::QueryWrite { id, ranges } => handle_write(engine, locks, session, id, &ranges),
        Request::QuerySnapshotRead { id, ranges } => handle_snapshot_read(engine, locks, session, id, &ranges),
        Request::FinishSnapshotRead { ranges, .. } => handle_finish_read(locks, session, &ranges),
        Request::Identify { id: _, snap_tag, offset, length } => handle_identify(engine, session, snap_tag, offset, length),
        Request::CreateSnapshot { tag } => match registry::create_snapshot(&mut engine.sb, tag, now_unix()) {
            Ok(_) => DispatchResult::reply(Response::CreateSnapshotOk),
            Err(e) => DispatchResult::reply(Response::CreateSnapshotError(err_body(e.into()))),
        },
        Request::DeleteSnapshot { tag } => {
            let chunk_size = engine.chunk_size();
            match registry::delete_snapshot(&mut engine.cache, &engine.metadata_device, &mut engine.sb, chunk_size, tag) {
                Ok(()) => DispatchResult::reply(Response::DeleteSnapshotOk),
                Err(e) => DispatchResult::reply(Response::DeleteSnapshotError(err_body(e.into()))),
            }
        }
        Request::ListSnapshots => {
            let entries = engine
                .sb
                .snapshots
                .iter()
                .map(|s| SnapshotEntry { tag: s.tag, priority: s.priority, ctime: s.ctime, usecount: s.usecount })
                .collect();
            DispatchResult::reply(Response::SnapshotList(entries))
        }
        Request::Priority { tag, priority } => match registry::set_priority(&mut engine.sb, tag, priority) {
            Ok(()) => DispatchResult::reply(Response::PriorityOk),
            Err(e) => DispatchResult::reply(Response::PriorityError(err_body(e.into()))),
        },
        Request::Usecount { tag, delta } => match registry::adjust_usecount(&mut engine.sb, tag, delta) {
            Ok(_) => DispatchResult::reply(Response::UsecountOk),
            Err(e) => DispatchResult::reply(Response::UsecountError(err_body(e.into()))),
        },
        Request::Status { tag_or_all } => match render_status(engine, tag_or_all) {
            Ok(text) => DispatchResult::reply(Response::StatusOk(text)),
            Err(e) => DispatchResult::reply(Response::StatusError(err_body(e))),
        },
        Request::StreamChangelist { tag1, tag2 } => match (resolve_bit(engine, tag1), resolve_bit(engine, tag2)) {
            (Some(b1), Some(b2)) => match btree::gen_changelist(&mut engine.cache, &engine.metadata_device, &engine.sb, b1, b2) {
                Ok(chunks) => DispatchResult::reply(Response::StreamChangelistOk {
                    count: chunks.len() as u32,
                    chunksize_bits: engine.chunk_size().trailing_zeros() as u8,
                    chunks,
                }),
                Err(e) => DispatchResult::reply(protocol_error(Code::StreamChangelist, e.to_string())),
            },
            _ => DispatchResult::reply(protocol_error(Code::StreamChangelist, "unknown snapshot tag")),
        },
        Request::RequestOriginSectors => DispatchResult::reply(Response::OriginSectors(engine.sb.origin_size_sectors)),
        Request::ShutdownServer => DispatchResult { reply: Reply::None, released: Vec::new(), shutdown: true },
    }
}

fn handle_write(
    engine: &mut Engine,
    locks: &mut LockTable,
    session: &mut Session,
    id: u64,
    ranges: &[chunksnap_proto::WriteRange],
) -> DispatchResult {
    let Some(view) = session.view else {
        return DispatchResult::reply(Response::OriginWriteError(err_body(not_identified())));
    };

    let pending = Pending::new();
    let mut out = Vec::new();
    for chunk in expand(ranges) {
        let exception = match engine.make_unique(chunk, view) {
            Ok(ex) => ex,
            Err(e) => {
                let body = err_body(e.into());
                return DispatchResult::reply(if view.is_origin() {
                    Response::OriginWriteError(body)
                } else {
                    Response::SnapshotWriteError(body)
                });
            }
        };
        if view.is_origin() && exception.is_some() {
            locks.waitfor_chunk(chunk, &pending);
        }
        out.push(ChangeRange { start: chunk, count: 1, exception: exception.map(|c| c.0) });
    }

    let response = if view.is_origin() {
        Response::OriginWriteOk { id, ranges: out }
    } else {
        Response::SnapshotWriteOk { id, ranges: out }
    };

    if view.is_origin() {
        match finish_pending(pending.clone()) {
            Some(_) => DispatchResult::reply(response),
            None => DispatchResult { reply: Reply::Deferred { pending, response }, released: Vec::new(), shutdown: false },
        }
    } else {
        DispatchResult::reply(response)
    }
}

fn handle_snapshot_read(
    engine: &mut Engine,
    locks: &mut LockTable,
    session: &mut Session,
    id: u64,
    ranges: &[chunksnap_proto::WriteRange],
) -> DispatchResult {
    let Some(view) = session.view else {
        return DispatchResult::reply(protocol_error(Code::QuerySnapshotRead, "session has not sent IDENTIFY"));
    };

    let mut out = Vec::new();
    for chunk in expand(ranges) {
        let (_, exception) = match engine.test_unique(chunk, view) {
            Ok(r) => r,
            Err(e) => return DispatchResult::reply(protocol_error(Code::QuerySnapshotRead, e.to_string())),
        };
        if exception.is_none() {
            locks.readlock_chunk(chunk, session.id);
            session.held_chunks.push(chunk);
        }
        out.push(ChangeRange { start: chunk, count: 1, exception: exception.map(|c| c.0) });
    }

    let response = if view.is_origin() {
        Response::SnapshotReadOriginOk { id, ranges: out }
    } else {
        Response::SnapshotReadOk { id, ranges: out }
    };
    DispatchResult::reply(response)
}

fn handle_finish_read(locks: &mut LockTable, session: &mut Session, ranges: &[chunksnap_proto::WriteRange]) -> DispatchResult {
    let chunks: Vec<u64> = expand(ranges).collect();
    let released = locks.release_all_for_client(&chunks, session.id);
    session.held_chunks.retain(|c| !chunks.contains(c));
    DispatchResult { reply: Reply::None, released, shutdown: false }
}

fn handle_identify(engine: &mut Engine, session: &mut Session, snap_tag: u32, offset: u64, length: u64) -> DispatchResult {
    let Some(view) = resolve_view(engine, snap_tag) else {
        return DispatchResult::reply(Response::IdentifyError(err_body(RequestError::new(
            ErrorCode::InvalidSnapshot,
            "unknown snapshot tag",
        ))));
    };
    if offset != engine.sb.origin_offset_sectors {
        return DispatchResult::reply(Response::IdentifyError(err_body(RequestError::new(
            ErrorCode::OffsetMismatch,
            "offset does not match the store's origin range",
        ))));
    }
    if length != engine.sb.origin_size_sectors {
        return DispatchResult::reply(Response::IdentifyError(err_body(RequestError::new(
            ErrorCode::SizeMismatch,
            "length does not match the store's origin size",
        ))));
    }

    session.view = Some(view);
    session.snap_tag = Some(snap_tag);
    if !view.is_origin() {
        let _ = registry::adjust_usecount(&mut engine.sb, snap_tag, 1);
    }
    let chunksize_bits = engine.chunk_size().trailing_zeros() as u8;
    DispatchResult::reply(Response::IdentifyOk { chunksize_bits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunksnap_fs_utils::BlockDevice;
    use chunksnap_journal::{Journal, Options as JournalOptions};
    use chunksnap_primitives::ChunkId;
    use chunksnap_storage::{leaf::Leaf, superblock::AllocDescriptor, BlockCache, Superblock};
    use mio::net::UnixStream;
    use tempfile::NamedTempFile;

    const CHUNK_SIZE: usize = 256;

    fn fixture() -> (NamedTempFile, NamedTempFile, NamedTempFile, Engine) {
        let meta = NamedTempFile::new().unwrap();
        let data = NamedTempFile::new().unwrap();
        let origin = NamedTempFile::new().unwrap();
        let meta_dev = BlockDevice::create(meta.path(), CHUNK_SIZE as u64 * 256).unwrap();
        let data_dev = BlockDevice::create(data.path(), CHUNK_SIZE as u64 * 256).unwrap();
        let origin_dev = BlockDevice::create(origin.path(), CHUNK_SIZE as u64 * 256).unwrap();

        let root = ChunkId(40);
        let mut cache = BlockCache::new(CHUNK_SIZE);
        let bytes = Leaf::empty(ChunkId(0)).to_bytes(CHUNK_SIZE, root).unwrap();
        cache.getblk(root).copy_from_slice(&bytes);
        cache.brelse_dirty(root);
        for d in cache.flush_buffers() {
            meta_dev.write_at(&d.data, d.sector).unwrap();
        }

        let desc = AllocDescriptor {
            chunk_size_bits: CHUNK_SIZE.trailing_zeros() as u8,
            total_chunks: 256,
            free_chunks: 200,
            bitmap_base: ChunkId(1),
            bitmap_blocks: 1,
            last_alloc: ChunkId(root.0),
        };
        let sb = Superblock::format(desc, desc, root, ChunkId(8), 16, 0, 4096, 0);
        let journal = Journal::format(JournalOptions { chunk_size: CHUNK_SIZE, journal_size: 16 }, 8);
        let engine = Engine::new(sb, meta_dev, origin_dev, data_dev, journal);
        (meta, data, origin, engine)
    }

    fn identified_session(engine: &Engine, tag: u32) -> Session {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut session = Session::new(1, a);
        session.view = resolve_view(engine, tag);
        session.snap_tag = Some(tag);
        session
    }

    #[test]
    fn identify_rejects_unknown_tag() {
        let (_m, _d, _o, mut engine) = fixture();
        let (a, _b) = UnixStream::pair().unwrap();
        let mut session = Session::new(1, a);
        let result = handle(&mut engine, &mut LockTable::new(4), &mut session, Request::Identify {
            id: 0,
            snap_tag: 7,
            offset: 0,
            length: 4096,
        });
        assert!(matches!(result.reply, Reply::Immediate(Response::IdentifyError(_))));
    }

    #[test]
    fn origin_write_replies_immediately_with_no_readers() {
        let (_m, _d, _o, mut engine) = fixture();
        let mut session = identified_session(&engine, ORIGIN_TAG);
        let mut locks = LockTable::new(4);
        let result = handle(&mut engine, &mut locks, &mut session, Request::QueryWrite {
            id: 1,
            ranges: vec![chunksnap_proto::WriteRange { chunk: 5, chunks: 1 }],
        });
        assert!(matches!(result.reply, Reply::Immediate(Response::OriginWriteOk { .. })));
    }

    #[test]
    fn origin_write_defers_when_a_read_lock_is_held() {
        let (_m, _d, _o, mut engine) = fixture();
        registry::create_snapshot(&mut engine.sb, 1, 0).unwrap();
        let mut locks = LockTable::new(4);

        let mut reader = identified_session(&engine, 1);
        reader.id = 2;
        let read_result = handle(&mut engine, &mut locks, &mut reader, Request::QuerySnapshotRead {
            id: 1,
            ranges: vec![chunksnap_proto::WriteRange { chunk: 5, chunks: 1 }],
        });
        assert!(matches!(read_result.reply, Reply::Immediate(Response::SnapshotReadOk { .. })));
        assert!(locks.is_locked(5));

        let mut writer = identified_session(&engine, ORIGIN_TAG);
        writer.id = 1;
        let write_result = handle(&mut engine, &mut locks, &mut writer, Request::QueryWrite {
            id: 2,
            ranges: vec![chunksnap_proto::WriteRange { chunk: 5, chunks: 1 }],
        });
        assert!(matches!(write_result.reply, Reply::Deferred { .. }));

        let finish = handle_finish_read(&mut locks, &mut reader, &[chunksnap_proto::WriteRange { chunk: 5, chunks: 1 }]);
        assert_eq!(finish.released.len(), 1);
    }

    #[test]
    fn shutdown_request_carries_no_reply() {
        let (_m, _d, _o, mut engine) = fixture();
        let mut session = identified_session(&engine, ORIGIN_TAG);
        let result = handle(&mut engine, &mut LockTable::new(4), &mut session, Request::ShutdownServer);
        assert!(matches!(result.reply, Reply::None));
        assert!(result.shutdown);
    }

    #[test]
    fn status_reports_unknown_tag_as_error() {
        let (_m, _d, _o, mut engine) = fixture();
        let mut session = identified_session(&engine, ORIGIN_TAG);
        let result = handle(&mut engine, &mut LockTable::new(4), &mut session, Request::Status { tag_or_all: 99 });
        assert!(matches!(result.reply, Reply::Immediate(Response::StatusError(_))));
    }
}
