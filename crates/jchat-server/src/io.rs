//! Receive, send and error handling for client connections.
//!
//! All three run on the reactor thread. Every socket is registered
//! edge-triggered, so reads and writes always continue until the kernel
//! reports `WouldBlock`.

use jchat_shared::{Message, ProtocolError, StatusCode};
use mio::Token;
use tracing::{debug, info, trace, warn};

use crate::connection::{read_until_blocked, Endpoint, Flush};
use crate::reactor::Reactor;

fn malformed_response() -> Message {
    Message::response(StatusCode::MALFORMED)
}

impl Reactor {
    /// Pull everything readable from the socket, decode complete messages
    /// and hand them to the request sink.
    pub(crate) fn receive(&mut self, token: Token) {
        let high_water = self.limits.outbound_high_water;
        let Some(Endpoint::Client(conn)) = self.table.get_mut(&token) else {
            return;
        };

        if conn.outbound.remaining() > high_water {
            if !conn.read_paused {
                debug!(
                    token = token.0,
                    backlog = conn.outbound.remaining(),
                    "Outbound backlog over limit, pausing reads"
                );
                conn.read_paused = true;
            }
            self.sync_interest(token);
            return;
        }

        match read_until_blocked(&mut conn.stream, &mut conn.inbound) {
            Ok(0) => return,
            Ok(n) => trace!(token = token.0, len = n, "Read from socket"),
            Err(e) => {
                self.fail(token, &e);
                return;
            }
        }

        let mut messages = Vec::new();
        let mut rejected = 0usize;
        let mut fatal: Option<ProtocolError> = None;
        loop {
            match conn.decoder.decode(&mut conn.inbound) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(token = token.0, peer = %conn.peer, error = %e, "Malformed message");
                    conn.outbound.push(&malformed_response().to_bytes());
                    rejected += 1;
                }
            }
        }

        for message in messages {
            trace!(token = token.0, method = %message.method, status = %message.status, "Decoded message");
            self.sink.on_message(token, message);
        }

        if let Some(e) = fatal {
            warn!(token = token.0, error = %e, "Unrecoverable stream error, closing connection");
            self.unregister(token);
            return;
        }
        if rejected > 0 {
            self.flush(token);
        }
    }

    /// Write queued bytes until the buffer drains or the socket blocks,
    /// then bring the registered interest in line with what is left.
    pub(crate) fn flush(&mut self, token: Token) {
        let Some(Endpoint::Client(conn)) = self.table.get_mut(&token) else {
            return;
        };

        let resumed = match conn.outbound.write_to(&mut conn.stream) {
            Ok(Flush::Complete) => {
                let resumed = conn.read_paused;
                conn.read_paused = false;
                resumed
            }
            Ok(Flush::Blocked) => {
                trace!(token = token.0, remaining = conn.outbound.remaining(), "Socket send buffer full");
                false
            }
            Err(e) => {
                self.fail(token, &e);
                return;
            }
        };

        self.sync_interest(token);

        // Bytes that arrived while paused are still in the kernel buffer.
        if resumed {
            debug!(token = token.0, "Outbound backlog drained, resuming reads");
            self.receive(token);
        }
    }

    /// Tear down a connection after an I/O failure or orderly close.
    pub(crate) fn fail(&mut self, token: Token, cause: &std::io::Error) {
        match cause.kind() {
            std::io::ErrorKind::UnexpectedEof => info!(token = token.0, "Peer closed connection"),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                info!(token = token.0, error = %cause, "Connection lost")
            }
            _ => warn!(token = token.0, error = %cause, "Socket error"),
        }
        self.unregister(token);
    }

    fn sync_interest(&mut self, token: Token) {
        let Some(Endpoint::Client(conn)) = self.table.get(&token) else {
            return;
        };
        let desired = conn.desired_interest();
        if desired != conn.interest {
            self.set_interest(token, desired.is_readable(), desired.is_writable());
        }
    }
}
