//! Message codes and bodies for the control-socket protocol.

use chunksnap_primitives::ErrorCode;

use crate::error::{Error, Result};
use crate::ErrorBody;

macro_rules! codes {
    ($($name:ident = $val:expr),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum Code {
            $($name = $val),+
        }

        impl TryFrom<u32> for Code {
            type Error = Error;
            fn try_from(v: u32) -> Result<Self> {
                match v {
                    $($val => Ok(Code::$name),)+
                    other => Err(Error::UnknownCode(other)),
                }
            }
        }
    };
}

codes! {
    QueryWrite = 1,
    OriginWriteOk = 2,
    OriginWriteError = 3,
    SnapshotWriteOk = 4,
    SnapshotWriteError = 5,
    QuerySnapshotRead = 6,
    SnapshotReadOriginOk = 7,
    SnapshotReadOk = 8,
    FinishSnapshotRead = 9,
    Identify = 10,
    IdentifyOk = 11,
    IdentifyError = 12,
    CreateSnapshot = 13,
    CreateSnapshotOk = 14,
    CreateSnapshotError = 15,
    DeleteSnapshot = 16,
    DeleteSnapshotOk = 17,
    DeleteSnapshotError = 18,
    ListSnapshots = 19,
    SnapshotList = 20,
    Priority = 21,
    PriorityOk = 22,
    PriorityError = 23,
    Usecount = 24,
    UsecountOk = 25,
    UsecountError = 26,
    Status = 27,
    StatusOk = 28,
    StatusError = 29,
    StreamChangelist = 30,
    StreamChangelistOk = 31,
    RequestOriginSectors = 32,
    OriginSectors = 33,
    ShutdownServer = 34,
    ProtocolError = 35,
}

/// One `{chunk, chunks}` range in a write query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRange {
    pub chunk: u64,
    pub chunks: u32,
}

/// One allocated `{start, count}` range in a write reply, with the
/// exception chunk tacked on for snapshot writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeRange {
    pub start: u64,
    pub count: u32,
    pub exception: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub tag: u32,
    pub priority: i8,
    pub ctime: u32,
    pub usecount: u32,
}

fn put_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn get_cstr(buf: &[u8]) -> Result<&str> {
    let nul = buf.iter().position(|&b| b == 0).ok_or(Error::UnterminatedString)?;
    std::str::from_utf8(&buf[..nul]).map_err(|_| Error::BadString)
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        Err(Error::Truncated { expected: len, found: buf.len() })
    } else {
        Ok(())
    }
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn encode_error_body(err: &ErrorBody) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + err.message.len() + 1);
    out.extend_from_slice(&err.code.as_u32().to_le_bytes());
    put_cstr(&mut out, &err.message);
    out
}

fn decode_error_body(buf: &[u8], code: ErrorCode) -> Result<ErrorBody> {
    need(buf, 4)?;
    let message = get_cstr(&buf[4..])?.to_owned();
    Ok(ErrorBody { code, message })
}

/// A fully decoded request body, paired with its [`Code`].
#[derive(Debug, Clone)]
pub enum Request {
    QueryWrite { id: u64, ranges: Vec<WriteRange> },
    QuerySnapshotRead { id: u64, ranges: Vec<WriteRange> },
    FinishSnapshotRead { id: u64, ranges: Vec<WriteRange> },
    Identify { id: u64, snap_tag: u32, offset: u64, length: u64 },
    CreateSnapshot { tag: u32 },
    DeleteSnapshot { tag: u32 },
    ListSnapshots,
    Priority { tag: u32, priority: i8 },
    Usecount { tag: u32, delta: i32 },
    Status { tag_or_all: i64 },
    StreamChangelist { tag1: u32, tag2: u32 },
    RequestOriginSectors,
    ShutdownServer,
}

fn decode_ranges(buf: &[u8]) -> Result<(u64, Vec<WriteRange>)> {
    need(buf, 12)?;
    let id = u64_at(buf, 0);
    let count = u32_at(buf, 8) as usize;
    let mut ranges = Vec::with_capacity(count);
    let mut off = 12;
    for _ in 0..count {
        need(buf, off + 12)?;
        ranges.push(WriteRange {
            chunk: u64_at(buf, off),
            chunks: u32_at(buf, off + 8),
        });
        off += 12;
    }
    Ok((id, ranges))
}

fn encode_ranges(out: &mut Vec<u8>, id: u64, ranges: &[WriteRange]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
    for r in ranges {
        out.extend_from_slice(&r.chunk.to_le_bytes());
        out.extend_from_slice(&r.chunks.to_le_bytes());
    }
}

impl Request {
    pub fn code(&self) -> Code {
        match self {
            Request::QueryWrite { .. } => Code::QueryWrite,
            Request::QuerySnapshotRead { .. } => Code::QuerySnapshotRead,
            Request::FinishSnapshotRead { .. } => Code::FinishSnapshotRead,
            Request::Identify { .. } => Code::Identify,
            Request::CreateSnapshot { .. } => Code::CreateSnapshot,
            Request::DeleteSnapshot { .. } => Code::DeleteSnapshot,
            Request::ListSnapshots => Code::ListSnapshots,
            Request::Priority { .. } => Code::Priority,
            Request::Usecount { .. } => Code::Usecount,
            Request::Status { .. } => Code::Status,
            Request::StreamChangelist { .. } => Code::StreamChangelist,
            Request::RequestOriginSectors => Code::RequestOriginSectors,
            Request::ShutdownServer => Code::ShutdownServer,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Request::QueryWrite { id, ranges }
            | Request::QuerySnapshotRead { id, ranges }
            | Request::FinishSnapshotRead { id, ranges } => encode_ranges(&mut out, *id, ranges),
            Request::Identify { id, snap_tag, offset, length } => {
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&snap_tag.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
            }
            Request::CreateSnapshot { tag } | Request::DeleteSnapshot { tag } => {
                out.extend_from_slice(&tag.to_le_bytes());
            }
            Request::ListSnapshots | Request::RequestOriginSectors | Request::ShutdownServer => {}
            Request::Priority { tag, priority } => {
                out.extend_from_slice(&tag.to_le_bytes());
                out.push(*priority as u8);
            }
            Request::Usecount { tag, delta } => {
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&delta.to_le_bytes());
            }
            Request::Status { tag_or_all } => out.extend_from_slice(&tag_or_all.to_le_bytes()),
            Request::StreamChangelist { tag1, tag2 } => {
                out.extend_from_slice(&tag1.to_le_bytes());
                out.extend_from_slice(&tag2.to_le_bytes());
            }
        }
        out
    }

    pub fn from_bytes(code: Code, buf: &[u8]) -> Result<Self> {
        Ok(match code {
            Code::QueryWrite => {
                let (id, ranges) = decode_ranges(buf)?;
                Request::QueryWrite { id, ranges }
            }
            Code::QuerySnapshotRead => {
                let (id, ranges) = decode_ranges(buf)?;
                Request::QuerySnapshotRead { id, ranges }
            }
            Code::FinishSnapshotRead => {
                let (id, ranges) = decode_ranges(buf)?;
                Request::FinishSnapshotRead { id, ranges }
            }
            Code::Identify => {
                need(buf, 28)?;
                Request::Identify {
                    id: u64_at(buf, 0),
                    snap_tag: u32_at(buf, 8),
                    offset: u64_at(buf, 12),
                    length: u64_at(buf, 20),
                }
            }
            Code::CreateSnapshot => {
                need(buf, 4)?;
                Request::CreateSnapshot { tag: u32_at(buf, 0) }
            }
            Code::DeleteSnapshot => {
                need(buf, 4)?;
                Request::DeleteSnapshot { tag: u32_at(buf, 0) }
            }
            Code::ListSnapshots => Request::ListSnapshots,
            Code::Priority => {
                need(buf, 5)?;
                Request::Priority {
                    tag: u32_at(buf, 0),
                    priority: buf[4] as i8,
                }
            }
            Code::Usecount => {
                need(buf, 8)?;
                Request::Usecount {
                    tag: u32_at(buf, 0),
                    delta: u32_at(buf, 4) as i32,
                }
            }
            Code::Status => {
                need(buf, 8)?;
                Request::Status {
                    tag_or_all: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
                }
            }
            Code::StreamChangelist => {
                need(buf, 8)?;
                Request::StreamChangelist {
                    tag1: u32_at(buf, 0),
                    tag2: u32_at(buf, 4),
                }
            }
            Code::RequestOriginSectors => Request::RequestOriginSectors,
            Code::ShutdownServer => Request::ShutdownServer,
            other => return Err(Error::UnknownCode(other as u32)),
        })
    }
}

/// A fully decoded response body, paired with its [`Code`].
#[derive(Debug, Clone)]
pub enum Response {
    OriginWriteOk { id: u64, ranges: Vec<ChangeRange> },
    OriginWriteError(ErrorBody),
    SnapshotWriteOk { id: u64, ranges: Vec<ChangeRange> },
    SnapshotWriteError(ErrorBody),
    SnapshotReadOriginOk { id: u64, ranges: Vec<ChangeRange> },
    SnapshotReadOk { id: u64, ranges: Vec<ChangeRange> },
    IdentifyOk { chunksize_bits: u8 },
    IdentifyError(ErrorBody),
    CreateSnapshotOk,
    CreateSnapshotError(ErrorBody),
    DeleteSnapshotOk,
    DeleteSnapshotError(ErrorBody),
    SnapshotList(Vec<SnapshotEntry>),
    PriorityOk,
    PriorityError(ErrorBody),
    UsecountOk,
    UsecountError(ErrorBody),
    StatusOk(String),
    StatusError(ErrorBody),
    StreamChangelistOk { count: u32, chunksize_bits: u8, chunks: Vec<u64> },
    OriginSectors(u64),
    ProtocolError { culprit_code: u32, message: String },
}

fn encode_change_ranges(out: &mut Vec<u8>, id: u64, ranges: &[ChangeRange]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
    for r in ranges {
        out.extend_from_slice(&r.start.to_le_bytes());
        out.extend_from_slice(&r.count.to_le_bytes());
        out.extend_from_slice(&r.exception.unwrap_or(u64::MAX).to_le_bytes());
    }
}

fn decode_change_ranges(buf: &[u8]) -> Result<(u64, Vec<ChangeRange>)> {
    need(buf, 12)?;
    let id = u64_at(buf, 0);
    let count = u32_at(buf, 8) as usize;
    let mut ranges = Vec::with_capacity(count);
    let mut off = 12;
    for _ in 0..count {
        need(buf, off + 20)?;
        let exception = u64_at(buf, off + 12);
        ranges.push(ChangeRange {
            start: u64_at(buf, off),
            count: u32_at(buf, off + 8),
            exception: if exception == u64::MAX { None } else { Some(exception) },
        });
        off += 20;
    }
    Ok((id, ranges))
}

impl Response {
    pub fn code(&self) -> Code {
        match self {
            Response::OriginWriteOk { .. } => Code::OriginWriteOk,
            Response::OriginWriteError(_) => Code::OriginWriteError,
            Response::SnapshotWriteOk { .. } => Code::SnapshotWriteOk,
            Response::SnapshotWriteError(_) => Code::SnapshotWriteError,
            Response::SnapshotReadOriginOk { .. } => Code::SnapshotReadOriginOk,
            Response::SnapshotReadOk { .. } => Code::SnapshotReadOk,
            Response::IdentifyOk { .. } => Code::IdentifyOk,
            Response::IdentifyError(_) => Code::IdentifyError,
            Response::CreateSnapshotOk => Code::CreateSnapshotOk,
            Response::CreateSnapshotError(_) => Code::CreateSnapshotError,
            Response::DeleteSnapshotOk => Code::DeleteSnapshotOk,
            Response::DeleteSnapshotError(_) => Code::DeleteSnapshotError,
            Response::SnapshotList(_) => Code::SnapshotList,
            Response::PriorityOk => Code::PriorityOk,
            Response::PriorityError(_) => Code::PriorityError,
            Response::UsecountOk => Code::UsecountOk,
            Response::UsecountError(_) => Code::UsecountError,
            Response::StatusOk(_) => Code::StatusOk,
            Response::StatusError(_) => Code::StatusError,
            Response::StreamChangelistOk { .. } => Code::StreamChangelistOk,
            Response::OriginSectors(_) => Code::OriginSectors,
            Response::ProtocolError { .. } => Code::ProtocolError,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Response::OriginWriteOk { id, ranges }
            | Response::SnapshotWriteOk { id, ranges }
            | Response::SnapshotReadOriginOk { id, ranges }
            | Response::SnapshotReadOk { id, ranges } => encode_change_ranges(&mut out, *id, ranges),
            Response::OriginWriteError(e)
            | Response::SnapshotWriteError(e)
            | Response::IdentifyError(e)
            | Response::CreateSnapshotError(e)
            | Response::DeleteSnapshotError(e)
            | Response::PriorityError(e)
            | Response::UsecountError(e)
            | Response::StatusError(e) => out = encode_error_body(e),
            Response::IdentifyOk { chunksize_bits } => out.push(*chunksize_bits),
            Response::CreateSnapshotOk | Response::DeleteSnapshotOk | Response::PriorityOk | Response::UsecountOk => {}
            Response::SnapshotList(entries) => {
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for e in entries {
                    out.extend_from_slice(&e.tag.to_le_bytes());
                    out.push(e.priority as u8);
                    out.extend_from_slice(&e.ctime.to_le_bytes());
                    out.extend_from_slice(&e.usecount.to_le_bytes());
                }
            }
            Response::StatusOk(text) => put_cstr(&mut out, text),
            Response::StreamChangelistOk { count, chunksize_bits, chunks } => {
                out.extend_from_slice(&count.to_le_bytes());
                out.push(*chunksize_bits);
                for c in chunks {
                    out.extend_from_slice(&c.to_le_bytes());
                }
            }
            Response::OriginSectors(sectors) => out.extend_from_slice(&sectors.to_le_bytes()),
            Response::ProtocolError { culprit_code, message } => {
                out.extend_from_slice(&ErrorCode::UnknownMessage.as_u32().to_le_bytes());
                out.extend_from_slice(&culprit_code.to_le_bytes());
                put_cstr(&mut out, message);
            }
        }
        out
    }

    pub fn from_bytes(code: Code, buf: &[u8]) -> Result<Self> {
        Ok(match code {
            Code::OriginWriteOk => {
                let (id, ranges) = decode_change_ranges(buf)?;
                Response::OriginWriteOk { id, ranges }
            }
            Code::SnapshotWriteOk => {
                let (id, ranges) = decode_change_ranges(buf)?;
                Response::SnapshotWriteOk { id, ranges }
            }
            Code::SnapshotReadOriginOk => {
                let (id, ranges) = decode_change_ranges(buf)?;
                Response::SnapshotReadOriginOk { id, ranges }
            }
            Code::SnapshotReadOk => {
                let (id, ranges) = decode_change_ranges(buf)?;
                Response::SnapshotReadOk { id, ranges }
            }
            Code::OriginWriteError => Response::OriginWriteError(decode_error_body(buf, ErrorCode::Io)?),
            Code::SnapshotWriteError => Response::SnapshotWriteError(decode_error_body(buf, ErrorCode::Io)?),
            Code::IdentifyError => Response::IdentifyError(decode_error_body(buf, ErrorCode::InvalidSnapshot)?),
            Code::CreateSnapshotError => Response::CreateSnapshotError(decode_error_body(buf, ErrorCode::InvalidSnapshot)?),
            Code::DeleteSnapshotError => Response::DeleteSnapshotError(decode_error_body(buf, ErrorCode::InvalidSnapshot)?),
            Code::PriorityError => Response::PriorityError(decode_error_body(buf, ErrorCode::InvalidSnapshot)?),
            Code::UsecountError => Response::UsecountError(decode_error_body(buf, ErrorCode::Usecount)?),
            Code::StatusError => Response::StatusError(decode_error_body(buf, ErrorCode::InvalidSnapshot)?),
            Code::IdentifyOk => {
                need(buf, 1)?;
                Response::IdentifyOk { chunksize_bits: buf[0] }
            }
            Code::CreateSnapshotOk => Response::CreateSnapshotOk,
            Code::DeleteSnapshotOk => Response::DeleteSnapshotOk,
            Code::PriorityOk => Response::PriorityOk,
            Code::UsecountOk => Response::UsecountOk,
            Code::SnapshotList => {
                need(buf, 4)?;
                let count = u32_at(buf, 0) as usize;
                let mut entries = Vec::with_capacity(count);
                let mut off = 4;
                for _ in 0..count {
                    need(buf, off + 13)?;
                    entries.push(SnapshotEntry {
                        tag: u32_at(buf, off),
                        priority: buf[off + 4] as i8,
                        ctime: u32_at(buf, off + 5),
                        usecount: u32_at(buf, off + 9),
                    });
                    off += 13;
                }
                Response::SnapshotList(entries)
            }
            Code::StatusOk => Response::StatusOk(get_cstr(buf)?.to_owned()),
            Code::StreamChangelistOk => {
                need(buf, 5)?;
                let count = u32_at(buf, 0);
                let chunksize_bits = buf[4];
                let mut chunks = Vec::with_capacity(count as usize);
                let mut off = 5;
                for _ in 0..count {
                    need(buf, off + 8)?;
                    chunks.push(u64_at(buf, off));
                    off += 8;
                }
                Response::StreamChangelistOk { count, chunksize_bits, chunks }
            }
            Code::OriginSectors => {
                need(buf, 8)?;
                Response::OriginSectors(u64_at(buf, 0))
            }
            Code::ProtocolError => {
                need(buf, 8)?;
                let culprit_code = u32_at(buf, 4);
                let message = get_cstr(&buf[8..])?.to_owned();
                Response::ProtocolError { culprit_code, message }
            }
            other => return Err(Error::UnknownCode(other as u32)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_query_round_trips() {
        let req = Request::QueryWrite {
            id: 42,
            ranges: vec![WriteRange { chunk: 10, chunks: 1 }, WriteRange { chunk: 20, chunks: 3 }],
        };
        let bytes = req.to_bytes();
        let back = Request::from_bytes(Code::QueryWrite, &bytes).unwrap();
        match back {
            Request::QueryWrite { id, ranges } => {
                assert_eq!(id, 42);
                assert_eq!(ranges.len(), 2);
                assert_eq!(ranges[1].chunk, 20);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn change_range_round_trips_with_exception() {
        let resp = Response::SnapshotWriteOk {
            id: 1,
            ranges: vec![ChangeRange { start: 5, count: 1, exception: Some(77) }],
        };
        let bytes = resp.to_bytes();
        let back = Response::from_bytes(Code::SnapshotWriteOk, &bytes).unwrap();
        match back {
            Response::SnapshotWriteOk { ranges, .. } => assert_eq!(ranges[0].exception, Some(77)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_body_carries_message() {
        let err = ErrorBody {
            code: ErrorCode::InvalidSnapshot,
            message: "no such tag".into(),
        };
        let resp = Response::CreateSnapshotError(err);
        let bytes = resp.to_bytes();
        let back = Response::from_bytes(Code::CreateSnapshotError, &bytes).unwrap();
        match back {
            Response::CreateSnapshotError(e) => assert_eq!(e.message, "no such tag"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(Code::try_from(999), Err(Error::UnknownCode(999))));
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert!(matches!(Request::from_bytes(Code::Identify, &[0u8; 4]), Err(Error::Truncated { .. })));
    }
}
