use std::io::ErrorKind;
use std::net::SocketAddr;

use jchat_shared::Decoder;
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Endpoint};
use crate::reactor::Reactor;

/// Hard accept failures tolerated in one readiness event before the loop
/// gives up until the next one. Keeps descriptor exhaustion from spinning.
const MAX_ACCEPT_FAILURES: usize = 32;

impl Reactor {
    /// Accept every pending connection on the listener behind `token`.
    pub(crate) fn accept_pending(&mut self, token: Token) {
        let Some(Endpoint::Listener(listener)) = self.table.get_mut(&token) else {
            return;
        };

        // Collect first, register afterwards: the listener stays borrowed
        // from the table while accepting.
        let mut accepted = Vec::new();
        let mut failures = 0;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => accepted.push((stream, peer)),
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        debug!(error = %e, "Transient accept error");
                        continue;
                    }
                    _ => {
                        failures += 1;
                        error!(error = %e, failures, "Error accepting connection");
                        if failures >= MAX_ACCEPT_FAILURES {
                            warn!("Too many accept failures, waiting for next readiness");
                            break;
                        }
                    }
                },
            }
        }

        for (stream, peer) in accepted {
            self.admit(stream, peer);
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let max = self.limits.max_connections;
        if max > 0 && self.connection_count() >= max {
            warn!(%peer, max, "Connection limit reached, refusing client");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let decoder = Decoder::with_limits(self.limits.max_line_len, self.limits.max_body_len);
        let conn = Connection::new(stream, peer, decoder);
        match self.register(Endpoint::Client(conn), Interest::READABLE) {
            Ok(token) => info!(token = token.0, %peer, "Accepted connection"),
            Err(e) => warn!(%peer, error = %e, "Failed to register connection"),
        }
    }
}
