//! Hands decoded requests from the reactor to the worker pool.
//!
//! Work for one connection runs in arrival order, one item at a time: the
//! first item starts a task on the pool, later items wait in that
//! connection's backlog and are picked up by the same task. The disconnect
//! cleanup is queued like any request, so it always runs after every
//! request the connection sent.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use jchat_shared::Message;
use mio::Token;
use tracing::{error, trace, warn};

use crate::handler::ChatService;
use crate::lock;
use crate::pool::WorkerPool;
use crate::reactor::RequestSink;

#[derive(Debug)]
enum Work {
    Request(Message),
    Disconnect,
}

type Backlog = Mutex<HashMap<Token, VecDeque<Work>>>;

pub struct WorkerSink {
    service: Arc<ChatService>,
    pool: Arc<WorkerPool>,
    backlog: Arc<Backlog>,
}

impl WorkerSink {
    pub fn new(service: Arc<ChatService>, pool: Arc<WorkerPool>) -> Self {
        Self {
            service,
            pool,
            backlog: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn schedule(&self, token: Token, work: Work) {
        let mut backlog = lock(&self.backlog);
        if let Some(queue) = backlog.get_mut(&token) {
            trace!(token = token.0, queued = queue.len() + 1, "Connection busy, queued work");
            queue.push_back(work);
            return;
        }
        backlog.insert(token, VecDeque::new());
        drop(backlog);

        let service = Arc::clone(&self.service);
        let strand_backlog = Arc::clone(&self.backlog);
        let accepted = self
            .pool
            .execute(move || run_strand(&service, &strand_backlog, token, work));
        if !accepted {
            warn!(token = token.0, "Worker pool rejected work");
            lock(&self.backlog).remove(&token);
        }
    }
}

impl RequestSink for WorkerSink {
    fn on_message(&self, token: Token, message: Message) {
        self.schedule(token, Work::Request(message));
    }

    fn on_disconnect(&self, token: Token) {
        self.schedule(token, Work::Disconnect);
    }
}

fn run_strand(service: &ChatService, backlog: &Backlog, token: Token, first: Work) {
    let mut next = Some(first);
    while let Some(work) = next {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match work {
            Work::Request(message) => service.handle(token, message),
            Work::Disconnect => service.disconnect(token),
        }));
        if outcome.is_err() {
            error!(token = token.0, "Request handler panicked");
        }

        let mut backlog = lock(backlog);
        next = backlog.get_mut(&token).and_then(VecDeque::pop_front);
        if next.is_none() {
            backlog.remove(&token);
        }
    }
}
