// src/conn.rs
use arrayvec::ArrayVec;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::handler::{Dispatcher, Reply};
use crate::http::Status;
use crate::parser::{ParseOutcome, RecvBuffer, RequestParser};
use crate::resource::MappedFile;
use crate::store::UserStore;
use crate::syscalls;

pub const WRITE_BUFFER_SIZE: usize = 2048;

const EMPTY_PAGE: &str = "<html><body></body></html>";

/// What the reactor should do after a worker processed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Request incomplete; wait for more bytes.
    NeedInput,
    /// A response is staged; wait for writability.
    Respond,
    /// The response could not be staged.
    Abort,
}

#[derive(Debug)]
pub enum ReadOutcome {
    /// Read until the socket would block. May be zero bytes.
    Read(usize),
    Eof,
    /// No room left in the receive buffer.
    Full,
    Failed(io::Error),
}

#[derive(Debug)]
pub enum WriteOutcome {
    WouldBlock,
    KeepAlive,
    Close,
    Failed(io::Error),
}

/// Write a response head: status line, `Content-Length`, `Connection` and
/// the terminating blank line.
pub fn write_head(
    out: &mut impl Write,
    status: Status,
    content_length: usize,
    keep_alive: bool,
) -> io::Result<()> {
    write!(out, "HTTP/1.1 {} {}\r\n", status.code(), status.title())?;
    write!(out, "Content-Length: {content_length}\r\n")?;
    let linger = if keep_alive { "keep-alive" } else { "close" };
    write!(out, "Connection: {linger}\r\n\r\n")
}

/// Per-socket state. Owned by the reactor, or by exactly one worker while a
/// request is being processed.
pub struct Connection {
    fd: RawFd,
    peer: Option<SocketAddr>,
    recv: RecvBuffer,
    parser: RequestParser,
    send: ArrayVec<u8, WRITE_BUFFER_SIZE>,
    body: Option<MappedFile>,
    sent: usize,
    keep_alive: bool,
    requests: u32,
}

impl Connection {
    pub fn new(fd: RawFd, peer: Option<SocketAddr>) -> Self {
        Self {
            fd,
            peer,
            recv: RecvBuffer::new(),
            parser: RequestParser::new(),
            send: ArrayVec::new(),
            body: None,
            sent: 0,
            keep_alive: false,
            requests: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    pub fn recv_buffer(&mut self) -> &mut RecvBuffer {
        &mut self.recv
    }

    /// Requests answered on this connection.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes still to send for the staged response.
    pub fn pending(&self) -> usize {
        self.total_len() - self.sent
    }

    /// Back to a fresh request. Any bytes left over from the previous read
    /// are dropped.
    pub fn reset(&mut self) {
        self.recv.clear();
        self.parser.reset();
        self.send.clear();
        self.body = None;
        self.sent = 0;
        self.keep_alive = false;
    }

    /// Drain the socket into the receive buffer until it would block or the
    /// buffer fills. `Full` only when there was no room before reading.
    pub fn read_from(&mut self) -> ReadOutcome {
        let mut total = 0;
        loop {
            if self.recv.is_full() {
                return match total {
                    0 => ReadOutcome::Full,
                    n => ReadOutcome::Read(n),
                };
            }
            match syscalls::recv_nonblocking(self.fd, self.recv.spare_mut()) {
                Ok(None) => return ReadOutcome::Read(total),
                Ok(Some(0)) => return ReadOutcome::Eof,
                Ok(Some(n)) => {
                    self.recv.commit(n);
                    total += n;
                }
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// Parse what has arrived and, once a request is complete, dispatch it
    /// and stage the response. Runs on a worker thread.
    pub fn process<S: UserStore + ?Sized>(&mut self, dispatcher: &Dispatcher, store: &mut S) -> ProcessOutcome {
        let staged = match self.parser.parse(&mut self.recv, dispatcher.default_document()) {
            ParseOutcome::Incomplete if !self.recv.is_full() => return ProcessOutcome::NeedInput,
            ParseOutcome::Incomplete => {
                tracing::debug!(fd = self.fd, peer = ?self.peer, "request does not fit the receive buffer");
                self.keep_alive = false;
                self.stage_status(Status::BadRequest)
            }
            ParseOutcome::Malformed => {
                tracing::debug!(fd = self.fd, peer = ?self.peer, "malformed request");
                // The request boundary is lost, so the connection cannot be reused.
                self.keep_alive = false;
                self.stage_status(Status::BadRequest)
            }
            ParseOutcome::Complete => {
                self.keep_alive = self.parser.keep_alive();
                tracing::debug!(
                    fd = self.fd,
                    peer = ?self.peer,
                    method = self.parser.method().as_str(),
                    target = self.parser.target(),
                    "request"
                );
                let reply = dispatcher.dispatch(
                    self.parser.method(),
                    self.parser.target(),
                    self.parser.body(),
                    store,
                );
                match reply {
                    Reply::File(file) => self.stage_file(file),
                    Reply::Error(status) => self.stage_status(status),
                }
            }
        };

        match staged {
            Ok(()) => {
                self.requests += 1;
                ProcessOutcome::Respond
            }
            Err(_) => {
                tracing::warn!(fd = self.fd, "response does not fit the send buffer");
                ProcessOutcome::Abort
            }
        }
    }

    fn stage_status(&mut self, status: Status) -> io::Result<()> {
        self.send.clear();
        self.body = None;
        self.sent = 0;
        let form = status.form();
        write_head(&mut self.send, status, form.len(), self.keep_alive)?;
        self.send.write_all(form.as_bytes())
    }

    fn stage_file(&mut self, file: MappedFile) -> io::Result<()> {
        self.send.clear();
        self.sent = 0;
        if file.is_empty() {
            self.body = None;
            write_head(&mut self.send, Status::Ok, EMPTY_PAGE.len(), self.keep_alive)?;
            return self.send.write_all(EMPTY_PAGE.as_bytes());
        }
        write_head(&mut self.send, Status::Ok, file.len(), self.keep_alive)?;
        self.body = Some(file);
        Ok(())
    }

    fn total_len(&self) -> usize {
        self.send.len() + self.body.as_ref().map_or(0, MappedFile::len)
    }

    /// Send as much of the staged response as the socket accepts. Returns the
    /// outcome and the number of bytes written by this call.
    pub fn write_to(&mut self) -> (WriteOutcome, usize) {
        let mut written = 0;
        loop {
            let head_len = self.send.len();
            let body = self.body.as_ref().map_or(&[][..], MappedFile::as_bytes);
            if self.sent >= head_len + body.len() {
                break;
            }

            let result = if self.sent < head_len {
                syscalls::sendv_nonblocking(self.fd, &[&self.send[self.sent..], body])
            } else {
                syscalls::send_nonblocking(self.fd, &body[self.sent - head_len..])
            };
            match result {
                Ok(None) => return (WriteOutcome::WouldBlock, written),
                Ok(Some(n)) => {
                    self.sent += n;
                    written += n;
                }
                Err(e) => return (WriteOutcome::Failed(e), written),
            }
        }

        self.body = None;
        if self.keep_alive {
            self.reset();
            (WriteOutcome::KeepAlive, written)
        } else {
            (WriteOutcome::Close, written)
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("read_idx", &self.recv.read_idx())
            .field("state", &self.parser.state())
            .field("pending", &self.pending())
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
