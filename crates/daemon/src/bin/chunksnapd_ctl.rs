//! `chunksnapd-ctl`: talks to a running daemon's control socket and
//! renders replies for a human operator.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use chunksnap_proto::{Code, Head, Request, Response};

#[derive(Debug, Parser)]
#[command(name = "chunksnapd-ctl", about = "Administrative client for chunksnapd")]
struct Cli {
    /// Control socket of the daemon to talk to.
    #[arg(long, default_value = "/var/lib/chunksnapd/chunksnapd.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Prints usecount/priority/ctime for one snapshot tag, or all of them.
    Status {
        #[arg(long)]
        tag: Option<u32>,
    },
    /// Lists every live snapshot.
    ListSnapshots,
    /// Creates a new snapshot under `tag`.
    CreateSnapshot { tag: u32 },
    /// Deletes the snapshot under `tag`.
    DeleteSnapshot { tag: u32 },
    /// Sets a snapshot's eviction priority.
    Priority { tag: u32, priority: i8 },
    /// Reports the size of the origin volume, in 512-byte sectors.
    OriginSectors,
    /// Asks the daemon to flush and exit cleanly.
    Shutdown,
}

fn send(socket: &mut UnixStream, request: &Request) -> anyhow::Result<Response> {
    let body = request.to_bytes();
    let head = Head::new(request.code() as u32, body.len() as u32);
    socket.write_all(&head.to_bytes())?;
    socket.write_all(&body)?;

    let mut head_buf = [0u8; Head::ENCODED_LEN];
    socket.read_exact(&mut head_buf)?;
    let head = Head::from_bytes(&head_buf)?;
    let mut body_buf = vec![0u8; head.length as usize];
    socket.read_exact(&mut body_buf)?;
    let code = Code::try_from(head.code)?;
    Ok(Response::from_bytes(code, &body_buf)?)
}

fn render(response: Response) -> anyhow::Result<()> {
    match response {
        Response::StatusOk(text) => println!("{text}"),
        Response::SnapshotList(entries) => {
            println!("{:>10} {:>8} {:>10} {:>10}", "tag", "priority", "usecount", "ctime");
            for e in entries {
                println!("{:>10} {:>8} {:>10} {:>10}", e.tag, e.priority, e.usecount, e.ctime);
            }
        }
        Response::OriginSectors(sectors) => println!("{sectors}"),
        Response::CreateSnapshotOk | Response::DeleteSnapshotOk | Response::PriorityOk | Response::UsecountOk => {
            println!("ok")
        }
        Response::StatusError(e) | Response::CreateSnapshotError(e) | Response::DeleteSnapshotError(e) | Response::PriorityError(e) => {
            anyhow::bail!("{}: {}", e.code, e.message)
        }
        Response::ProtocolError { culprit_code, message } => anyhow::bail!("protocol error (code {culprit_code}): {message}"),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut socket = UnixStream::connect(&cli.socket)?;

    let request = match cli.command {
        SubCommand::Status { tag } => Request::Status { tag_or_all: tag.map(i64::from).unwrap_or(-1) },
        SubCommand::ListSnapshots => Request::ListSnapshots,
        SubCommand::CreateSnapshot { tag } => Request::CreateSnapshot { tag },
        SubCommand::DeleteSnapshot { tag } => Request::DeleteSnapshot { tag },
        SubCommand::Priority { tag, priority } => Request::Priority { tag, priority },
        SubCommand::OriginSectors => Request::RequestOriginSectors,
        SubCommand::Shutdown => Request::ShutdownServer,
    };

    if matches!(request, Request::ShutdownServer) {
        let body = request.to_bytes();
        let head = Head::new(request.code() as u32, body.len() as u32);
        socket.write_all(&head.to_bytes())?;
        socket.write_all(&body)?;
        return Ok(());
    }

    render(send(&mut socket, &request)?)
}
