//! Single-threaded readiness loop.
//!
//! The reactor owns the poller and every registered socket. Each readiness
//! event is routed by token: the waker token drains posted [`Command`]s,
//! listener tokens run the accept loop, client tokens run the receive and
//! send handlers. A token is looked up again before every callback, so an
//! event that arrives for a connection torn down earlier in the same batch
//! is ignored.
//!
//! Decoded requests leave the reactor thread through a [`RequestSink`];
//! responses come back as [`Command::Send`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use jchat_shared::Message;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use crate::connection::Endpoint;
use crate::outbox::{Command, ReactorHandle, WAKER_TOKEN};

/// Receives complete requests and connection teardown from the reactor.
pub trait RequestSink: Send + Sync {
    /// One fully decoded message from `token`, in arrival order.
    fn on_message(&self, token: Token, message: Message);

    /// `token` has been deregistered and its socket closed.
    fn on_disconnect(&self, token: Token);
}

/// Per-connection limits applied by the reactor.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// 0 = unlimited
    pub max_connections: usize,
    pub max_line_len: usize,
    pub max_body_len: usize,
    pub outbound_high_water: usize,
}

pub struct Reactor {
    pub(crate) poll: Poll,
    events: Events,
    pub(crate) table: HashMap<Token, Endpoint>,
    next_token: usize,
    commands: Receiver<Command>,
    handle: ReactorHandle,
    pub(crate) sink: Arc<dyn RequestSink>,
    pub(crate) limits: Limits,
    running: bool,
}

impl Reactor {
    pub fn new(
        poll: Poll,
        handle: ReactorHandle,
        commands: Receiver<Command>,
        sink: Arc<dyn RequestSink>,
        limits: Limits,
        max_events: usize,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(max_events.max(1)),
            table: HashMap::new(),
            next_token: WAKER_TOKEN.0 + 1,
            commands,
            handle,
            sink,
            limits,
            running: true,
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Bind a listener and register it for incoming connections.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let token = self.register(Endpoint::Listener(listener), Interest::READABLE)?;
        info!(token = token.0, %local_addr, "Listening for connections");
        Ok(local_addr)
    }

    // ----- registration -----

    /// Register `endpoint` under a fresh token. Tokens are never reused.
    pub fn register(&mut self, mut endpoint: Endpoint, interest: Interest) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(endpoint.source(), token, interest)?;
        if let Endpoint::Client(conn) = &mut endpoint {
            conn.interest = interest;
        }
        self.table.insert(token, endpoint);
        Ok(token)
    }

    /// Deregister and close whatever is registered under `token`.
    /// Returns `false` if nothing was.
    pub fn unregister(&mut self, token: Token) -> bool {
        let Some(mut endpoint) = self.table.remove(&token) else {
            warn!(token = token.0, "Unregister for unknown token");
            return false;
        };
        if let Err(e) = self.poll.registry().deregister(endpoint.source()) {
            warn!(token = token.0, error = %e, "Failed to deregister");
        }
        if let Endpoint::Client(conn) = &endpoint {
            info!(token = token.0, peer = %conn.peer, "Closed connection");
            self.sink.on_disconnect(token);
        }
        true
    }

    /// Change the readiness interest of a registered endpoint. Requests for
    /// unknown tokens, or for no interest at all, are ignored.
    pub fn set_interest(&mut self, token: Token, readable: bool, writable: bool) {
        let interest = match (readable, writable) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => {
                warn!(token = token.0, "Ignoring request for empty interest");
                return;
            }
        };
        let Some(endpoint) = self.table.get_mut(&token) else {
            debug!(token = token.0, "Interest change for unknown token");
            return;
        };
        if let Err(e) = self
            .poll
            .registry()
            .reregister(endpoint.source(), token, interest)
        {
            warn!(token = token.0, error = %e, "Failed to change interest");
            return;
        }
        if let Endpoint::Client(conn) = endpoint {
            conn.interest = interest;
        }
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.table.contains_key(&token)
    }

    pub fn connection_count(&self) -> usize {
        self.table.values().filter(|e| e.is_client()).count()
    }

    // ----- event loop -----

    /// Wait up to `timeout` for readiness and run the callbacks for every
    /// event collected.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        // Error and hang-up conditions run both handlers so the failing
        // read or write reports the cause.
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let failed = event.is_error() || event.is_read_closed() || event.is_write_closed();
                (
                    event.token(),
                    event.is_readable() || failed,
                    event.is_writable() || failed,
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token == WAKER_TOKEN {
                self.drain_commands();
                continue;
            }
            if readable && self.is_registered(token) {
                self.on_readable(token);
            }
            if writable && self.is_registered(token) {
                self.on_writable(token);
            }
        }
        Ok(())
    }

    /// Dispatch until [`ReactorHandle::shutdown`] is called, then close
    /// every endpoint.
    pub fn run(&mut self, timeout: Duration) -> io::Result<()> {
        info!("Reactor running");
        while self.running {
            self.dispatch(Some(timeout))?;
        }
        self.close_all();
        info!("Reactor stopped");
        Ok(())
    }

    fn on_readable(&mut self, token: Token) {
        match self.table.get(&token) {
            Some(Endpoint::Listener(_)) => self.accept_pending(token),
            Some(Endpoint::Client(_)) => self.receive(token),
            None => {}
        }
    }

    fn on_writable(&mut self, token: Token) {
        if let Some(Endpoint::Client(_)) = self.table.get(&token) {
            self.flush(token);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send { token, frame } => self.enqueue(token, &frame),
                Command::Shutdown => {
                    info!("Shutdown requested");
                    self.running = false;
                }
            }
        }
    }

    fn enqueue(&mut self, token: Token, frame: &[u8]) {
        match self.table.get_mut(&token) {
            Some(Endpoint::Client(conn)) => {
                trace!(token = token.0, len = frame.len(), "Queued outbound frame");
                conn.outbound.push(frame);
            }
            _ => {
                debug!(token = token.0, "Dropping frame for closed connection");
                return;
            }
        }
        self.flush(token);
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.table.keys().copied().collect();
        for token in tokens {
            self.unregister(token);
        }
    }
}
