//! End-to-end test of the real control socket: format a fresh store,
//! run the server on a background thread, and drive it with a plain
//! `std::os::unix::net::UnixStream` the way a real client would.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use chunksnap_daemon::config::Settings;
use chunksnap_daemon::{format, open_engine, server::Server};
use chunksnap_fs_utils::BlockDevice;
use chunksnap_paths::{ControlSocketPath, MetadataDevicePath, OriginDevicePath, SnapshotDataDevicePath, StoreDir};
use chunksnap_primitives::ORIGIN_TAG;
use chunksnap_proto::{Code, Head, Request, Response};

fn settings(dir: &tempfile::TempDir) -> Settings {
    let metadata = dir.path().join("metadata.img");
    let origin = dir.path().join("origin.img");
    let socket = dir.path().join("chunksnapd.sock");

    BlockDevice::create(&metadata, 4096 * 2048).unwrap();
    BlockDevice::create(&origin, 4096 * 256).unwrap();

    Settings {
        store_dir: StoreDir(dir.path().to_path_buf()),
        metadata_device: MetadataDevicePath(metadata.clone()),
        snapshot_device: SnapshotDataDevicePath(metadata),
        origin_device: OriginDevicePath(origin),
        socket: ControlSocketPath(socket),
        chunk_size: 4096,
        journal_size: 16,
        snaplock_hash_bits: 4,
    }
}

fn roundtrip(socket: &mut UnixStream, request: Request) -> Response {
    let body = request.to_bytes();
    let head = Head::new(request.code() as u32, body.len() as u32);
    socket.write_all(&head.to_bytes()).unwrap();
    socket.write_all(&body).unwrap();

    let mut head_buf = [0u8; Head::ENCODED_LEN];
    socket.read_exact(&mut head_buf).unwrap();
    let head = Head::from_bytes(&head_buf).unwrap();
    let mut body_buf = vec![0u8; head.length as usize];
    socket.read_exact(&mut body_buf).unwrap();
    Response::from_bytes(Code::try_from(head.code).unwrap(), &body_buf).unwrap()
}

#[test]
fn copy_on_write_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    format::run(&settings).unwrap();

    let engine = open_engine(&settings).unwrap();
    let server = Server::new(engine, settings.snaplock_hash_bits, &settings.socket.0).unwrap();
    let socket_path = settings.socket.0.clone();
    let handle = std::thread::spawn(move || server.run());

    let mut socket = connect_with_retry(&socket_path);

    let origin_sectors = roundtrip(&mut socket, Request::RequestOriginSectors);
    let Response::OriginSectors(length) = origin_sectors else { panic!("expected OriginSectors, got {origin_sectors:?}") };

    let identify = roundtrip(&mut socket, Request::Identify { id: 0, snap_tag: ORIGIN_TAG, offset: 0, length });
    assert!(matches!(identify, Response::IdentifyOk { .. }));

    let create = roundtrip(&mut socket, Request::CreateSnapshot { tag: 1 });
    assert!(matches!(create, Response::CreateSnapshotOk));

    let write = roundtrip(&mut socket, Request::QueryWrite {
        id: 1,
        ranges: vec![chunksnap_proto::WriteRange { chunk: 10, chunks: 1 }],
    });
    match write {
        Response::OriginWriteOk { ranges, .. } => {
            assert_eq!(ranges.len(), 1);
            assert!(ranges[0].exception.is_some(), "first write after a snapshot must create an exception");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    let status = roundtrip(&mut socket, Request::Status { tag_or_all: -1 });
    assert!(matches!(status, Response::StatusOk(_)));

    // SHUTDOWN_SERVER has no reply on the wire; write the request directly
    // rather than going through `roundtrip`, which would block on a read
    // that never arrives.
    let shutdown_body = Request::ShutdownServer.to_bytes();
    let shutdown_head = Head::new(Request::ShutdownServer.code() as u32, shutdown_body.len() as u32);
    socket.write_all(&shutdown_head.to_bytes()).unwrap();
    socket.write_all(&shutdown_body).unwrap();

    handle.join().unwrap().unwrap();
}

fn connect_with_retry(path: &std::path::Path) -> UnixStream {
    for _ in 0..50 {
        if let Ok(s) = UnixStream::connect(path) {
            return s;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("server never accepted a connection at {path:?}");
}
