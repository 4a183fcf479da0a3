use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use jchat_shared::Decoder;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use tracing::trace;

/// Bytes pulled from a socket per `read` call.
const READ_CHUNK: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Outbound buffer
// ---------------------------------------------------------------------------

/// Result of pushing queued bytes into a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued has been written.
    Complete,
    /// The socket stopped accepting bytes; the rest stays queued.
    Blocked,
}

/// Queued outbound bytes with an explicit send cursor.
///
/// `pending()` is always `data[sent..]`. The cursor resets to zero whenever
/// the buffer drains, and already-sent bytes are discarded when a write
/// blocks, so the buffer never grows with history.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    data: BytesMut,
    sent: usize,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &[u8]) {
        self.data.extend_from_slice(frame);
    }

    pub fn pending(&self) -> &[u8] {
        &self.data[self.sent..]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    pub fn bytes_total(&self) -> usize {
        self.data.len()
    }

    fn advance(&mut self, n: usize) {
        self.sent += n;
        if self.sent == self.data.len() {
            self.data.clear();
            self.sent = 0;
        }
    }

    fn compact(&mut self) {
        if self.sent > 0 {
            self.data.advance(self.sent);
            self.sent = 0;
        }
    }

    /// Write until the buffer is empty or `dst` would block.
    ///
    /// Short writes are retried at the new offset and `Interrupted` is
    /// retried immediately. A zero-length write is treated as a dead peer.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<Flush> {
        loop {
            if self.is_empty() {
                return Ok(Flush::Complete);
            }
            match dst.write(self.pending()) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    trace!(len = n, remaining = self.remaining() - n, "Wrote to socket");
                    self.advance(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.compact();
                    return Ok(Flush::Blocked);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Read from `src` into `dst` until the source would block.
///
/// Returns the number of bytes read. An orderly shutdown by the peer is
/// reported as `UnexpectedEof` so the caller tears the connection down like
/// any other read failure.
pub fn read_until_blocked<R: Read>(src: &mut R, dst: &mut BytesMut) -> io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut total = 0;
    loop {
        match src.read(&mut chunk) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                dst.extend_from_slice(&chunk[..n]);
                total += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Registered endpoints
// ---------------------------------------------------------------------------

/// One accepted client.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) inbound: BytesMut,
    pub(crate) outbound: OutboundBuffer,
    pub(crate) decoder: Decoder,
    /// Interest currently registered with the poller.
    pub(crate) interest: Interest,
    /// Reading is suspended until the outbound backlog drains.
    pub(crate) read_paused: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, decoder: Decoder) -> Self {
        Self {
            stream,
            peer,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: OutboundBuffer::new(),
            decoder,
            interest: Interest::READABLE,
            read_paused: false,
        }
    }

    /// Interest matching the current buffer state: readable unless paused,
    /// writable while bytes are queued.
    pub(crate) fn desired_interest(&self) -> Interest {
        match (self.read_paused, self.outbound.is_empty()) {
            (false, true) => Interest::READABLE,
            (false, false) => Interest::READABLE | Interest::WRITABLE,
            (true, _) => Interest::WRITABLE,
        }
    }
}

/// Everything the reactor can have registered under a token.
#[derive(Debug)]
pub enum Endpoint {
    Listener(TcpListener),
    Client(Connection),
}

impl Endpoint {
    pub(crate) fn source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Endpoint::Listener(listener) => listener,
            Endpoint::Client(conn) => &mut conn.stream,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Endpoint::Client(_))
    }
}
