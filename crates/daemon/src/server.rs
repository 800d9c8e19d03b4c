//! Single-threaded `mio` event loop: one listen socket, a signal channel,
//! and up to [`MAX_CLIENTS`] client sessions, all multiplexed over one
//! `poll` call.
//!
//! Nothing here spawns a thread. The only blocking primitive in the whole
//! process is `Poll::poll`; a reply that cannot be sent immediately (an
//! origin write waiting on a snap-read lock) is parked rather than
//! blocking this loop, and delivered from whichever later event causes
//! its lock to clear.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::UnixListener as StdUnixListener;

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;

use chunksnap_primitives::ORIGIN_TAG;
use chunksnap_proto::{Code, Head, Request, Response};
use chunksnap_storage::Engine;

use crate::dispatch::{self, Reply};
use crate::locktable::LockTable;
use crate::session::Session;

/// Matches the wire table's "up to 100 client sockets" capacity.
const MAX_CLIENTS: usize = 100;

const LISTENER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

struct ParkedReply {
    pending: std::rc::Rc<std::cell::RefCell<crate::locktable::Pending>>,
    session_token: Token,
    response: Response,
}

pub struct Server {
    engine: Engine,
    locks: LockTable,
    listener: UnixListener,
    signals: Signals,
    poll: Poll,
    sessions: HashMap<Token, Session>,
    parked: Vec<ParkedReply>,
    next_token: usize,
    next_session_id: u64,
    shutting_down: bool,
}

impl Server {
    pub fn new(engine: Engine, snaplock_hash_bits: u8, socket_path: &std::path::Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(socket_path);
        let std_listener = StdUnixListener::bind(socket_path)?;
        std_listener.set_nonblocking(true)?;
        let mut listener = UnixListener::from_std(std_listener);

        let mut poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        poll.registry().register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        Ok(Self {
            engine,
            locks: LockTable::new(snaplock_hash_bits),
            listener,
            signals,
            poll,
            sessions: HashMap::new(),
            parked: Vec::new(),
            next_token: FIRST_CLIENT_TOKEN,
            next_session_id: 1,
            shutting_down: false,
        })
    }

    /// Runs until a termination signal is handled or `SHUTDOWN_SERVER` is
    /// received, at which point the superblock is flushed and the busy
    /// flag is cleared before returning.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, None)?;
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_all()?,
                    SIGNAL_TOKEN => {
                        for signal in self.signals.pending() {
                            if signal == SIGINT || signal == SIGTERM {
                                tracing::info!(signal, "received shutdown signal");
                                self.clean_shutdown()?;
                                return Ok(());
                            }
                        }
                    }
                    token => self.handle_client_event(token),
                }
            }
            if self.shutting_down {
                self.clean_shutdown()?;
                return Ok(());
            }
        }
    }

    fn accept_all(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, _addr)) => self.add_session(socket)?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn add_session(&mut self, mut socket: UnixStream) -> io::Result<()> {
        if self.sessions.len() >= MAX_CLIENTS {
            tracing::warn!("client limit reached, dropping new connection");
            return Ok(());
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(&mut socket, token, Interest::READABLE)?;
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(token, Session::new(id, socket));
        Ok(())
    }

    fn handle_client_event(&mut self, token: Token) {
        if self.read_into_buffer(token) {
            self.drain_requests(token);
        }
        self.flush_writes(token);
        if self.sessions.get(&token).map(|s| s.closing).unwrap_or(false) {
            self.close_session(token);
        }
    }

    /// Returns whether the session is still open after this read.
    fn read_into_buffer(&mut self, token: Token) -> bool {
        let Some(session) = self.sessions.get_mut(&token) else { return false };
        let mut buf = [0u8; 4096];
        loop {
            match session.socket.read(&mut buf) {
                Ok(0) => {
                    session.closing = true;
                    return true;
                }
                Ok(n) => session.read_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) => {
                    tracing::warn!(error = %e, "read error, closing session");
                    session.closing = true;
                    return true;
                }
            }
        }
    }

    fn drain_requests(&mut self, token: Token) {
        loop {
            let Some(session) = self.sessions.get(&token) else { return };
            if session.read_buf.len() < Head::ENCODED_LEN {
                return;
            }
            let head = match Head::from_bytes(&session.read_buf) {
                Ok(h) => h,
                Err(e) => {
                    self.fail_session(token, 0, &e.to_string());
                    return;
                }
            };
            let total = Head::ENCODED_LEN + head.length as usize;
            let session = self.sessions.get(&token).unwrap();
            if session.read_buf.len() < total {
                return;
            }
            let body = session.read_buf[Head::ENCODED_LEN..total].to_vec();

            let code = match Code::try_from(head.code) {
                Ok(c) => c,
                Err(e) => {
                    self.fail_session(token, head.code, &e.to_string());
                    return;
                }
            };
            let request = match Request::from_bytes(code, &body) {
                Ok(r) => r,
                Err(e) => {
                    self.fail_session(token, head.code, &e.to_string());
                    return;
                }
            };

            let session = self.sessions.get_mut(&token).unwrap();
            session.read_buf.drain(0..total);
            chunksnap_metrics::METRICS.requests_total.with_label_values(&[&format!("{code:?}")]).inc();

            self.dispatch_one(token, request);

            if self.engine.should_commit() {
                if let Err(e) = self.engine.commit() {
                    tracing::error!(error = %e, "journal commit failed");
                }
            }
        }
    }

    fn dispatch_one(&mut self, token: Token, request: Request) {
        let Some(mut session) = self.sessions.remove(&token) else { return };
        let result = dispatch::handle(&mut self.engine, &mut self.locks, &mut session, request);

        if result.shutdown {
            self.shutting_down = true;
        }

        match result.reply {
            Reply::Immediate(resp) => enqueue(&mut session, &resp),
            Reply::Deferred { pending, response } => {
                self.parked.push(ParkedReply { pending, session_token: token, response });
            }
            Reply::None => {}
        }
        self.sessions.insert(token, session);

        self.deliver_released(result.released);
    }

    fn deliver_released(&mut self, released: Vec<std::rc::Rc<std::cell::RefCell<crate::locktable::Pending>>>) {
        if released.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.parked.len());
        for parked in self.parked.drain(..) {
            if released.iter().any(|p| std::rc::Rc::ptr_eq(p, &parked.pending)) {
                if let Some(session) = self.sessions.get_mut(&parked.session_token) {
                    enqueue(session, &parked.response);
                }
            } else {
                remaining.push(parked);
            }
        }
        self.parked = remaining;
    }

    fn flush_writes(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else { return };
        while !session.write_buf.is_empty() {
            let chunk: Vec<u8> = session.write_buf.iter().copied().collect();
            match session.socket.write(&chunk) {
                Ok(0) => break,
                Ok(n) => {
                    session.write_buf.drain(0..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "write error, closing session");
                    session.closing = true;
                    break;
                }
            }
        }
    }

    fn fail_session(&mut self, token: Token, culprit_code: u32, message: &str) {
        if let Some(session) = self.sessions.get_mut(&token) {
            let resp = Response::ProtocolError { culprit_code, message: message.to_owned() };
            enqueue(session, &resp);
            session.closing = true;
        }
        self.flush_writes(token);
        self.close_session(token);
    }

    fn close_session(&mut self, token: Token) {
        let Some(mut session) = self.sessions.remove(&token) else { return };
        let chunks = std::mem::take(&mut session.held_chunks);
        let released = self.locks.release_all_for_client(&chunks, session.id);
        self.deliver_released(released);
        if let Some(tag) = session.snap_tag {
            if tag != ORIGIN_TAG {
                let _ = chunksnap_storage::registry::adjust_usecount(&mut self.engine.sb, tag, -1);
            }
        }
        let _ = self.poll.registry().deregister(&mut session.socket);
    }

    fn clean_shutdown(&mut self) -> io::Result<()> {
        self.engine.sb.busy = false;
        if let Err(e) = self.engine.commit() {
            tracing::warn!(error = %e, "final commit failed during shutdown");
        }
        if let Err(e) = self.engine.write_superblock() {
            tracing::warn!(error = %e, "final superblock write failed during shutdown");
        }
        Ok(())
    }
}

fn enqueue(session: &mut Session, response: &Response) {
    let body = response.to_bytes();
    let head = Head::new(response.code() as u32, body.len() as u32);
    session.queue_write(&head.to_bytes());
    session.queue_write(&body);
}
