//! Cross-thread channel from workers back to the reactor thread.
//!
//! Only the reactor thread touches sockets. Everybody else names a
//! connection by its [`Token`] and posts a [`Command`]; the reactor checks
//! the token against its registration table when it drains the channel, so a
//! command for a connection that has since been torn down is dropped.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use bytes::Bytes;
use mio::{Poll, Token, Waker};
use tracing::{debug, warn};

/// Token reserved for the reactor's waker. Connection tokens start above it.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Work posted to the reactor thread.
#[derive(Debug)]
pub enum Command {
    /// Append an encoded frame to a connection's outbound buffer.
    Send { token: Token, frame: Bytes },
    /// Leave the event loop after the current dispatch.
    Shutdown,
}

/// Where handlers and the notifier deliver encoded frames.
pub trait Outbox: Send + Sync {
    /// Queue `frame` for the connection registered under `token`.
    /// Frames for unknown tokens are dropped by the receiving side.
    fn send(&self, token: Token, frame: Bytes);
}

/// Cloneable handle to a running reactor.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Create the handle and the receiving end for the reactor registered on
    /// `poll`.
    pub(crate) fn channel(poll: &Poll) -> std::io::Result<(Self, Receiver<Command>)> {
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (commands, receiver) = mpsc::channel();
        Ok((Self { commands, waker }, receiver))
    }

    /// Ask the reactor to stop. Safe to call from any thread, more than once.
    pub fn shutdown(&self) {
        self.post(Command::Shutdown);
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Reactor has stopped, dropping command");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

impl Outbox for ReactorHandle {
    fn send(&self, token: Token, frame: Bytes) {
        self.post(Command::Send { token, frame });
    }
}
