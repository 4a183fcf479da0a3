//! Notification serializer.
//!
//! Server-initiated messages go through a FIFO drained by a small set of
//! dispatcher threads. A dispatcher hands each notification to the worker
//! pool as a send task, but never while another send task for the same
//! connection is still in flight: the destination is marked busy first and
//! the send task clears the mark when it finishes, panic or not. A
//! notification whose destination is busy goes back to the end of the queue.
//!
//! The resulting guarantee is that two notifications for one connection
//! are never encoded and enqueued concurrently, so their bytes cannot
//! interleave on the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use jchat_shared::Message;
use mio::Token;
use tracing::{debug, error, info, trace, warn};

use crate::lock;
use crate::outbox::Outbox;
use crate::pool::WorkerPool;

/// Back-off when every queued notification targets a busy connection.
const RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Notification {
    token: Token,
    message: Message,
}

struct State {
    queue: VecDeque<Notification>,
    /// `true` while a send task for the connection is in flight. Present
    /// only while notifications for it are queued or in flight.
    busy: HashMap<Token, bool>,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    pool: Arc<WorkerPool>,
    outbox: Arc<dyn Outbox>,
}

pub struct Notifier {
    shared: Arc<Shared>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Notifier {
    /// Start `threads` dispatchers (at least one) that deliver through
    /// `pool` into `outbox`.
    pub fn start(threads: usize, pool: Arc<WorkerPool>, outbox: Arc<dyn Outbox>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                busy: HashMap::new(),
                running: true,
            }),
            changed: Condvar::new(),
            pool,
            outbox,
        });

        let dispatchers = (0..threads.max(1))
            .filter_map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("jchat-notify-{id}"))
                    .spawn(move || dispatch_loop(shared, id))
                    .map_err(|e| error!(dispatcher = id, error = %e, "Failed to spawn dispatcher"))
                    .ok()
            })
            .collect::<Vec<_>>();

        info!(dispatchers = dispatchers.len(), "Notifier started");
        Self {
            shared,
            dispatchers: Mutex::new(dispatchers),
        }
    }

    /// Queue `message` for the connection behind `token`.
    pub fn notify(&self, token: Token, message: Message) {
        let mut state = lock(&self.shared.state);
        if !state.running {
            warn!(token = token.0, "Notifier stopped, dropping notification");
            return;
        }
        trace!(token = token.0, status = %message.status, "Queued notification");
        state.queue.push_back(Notification { token, message });
        drop(state);
        self.shared.changed.notify_one();
    }

    /// Drop the occupancy entry of a closed connection.
    pub fn forget(&self, token: Token) {
        lock(&self.shared.state).busy.remove(&token);
    }

    /// Notifications waiting for a dispatcher.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// Stop accepting notifications, deliver what is queued, then join the
    /// dispatchers. Call before shutting down the worker pool.
    pub fn shutdown(&self) {
        lock(&self.shared.state).running = false;
        self.shared.changed.notify_all();

        let dispatchers = std::mem::take(&mut *lock(&self.dispatchers));
        for dispatcher in dispatchers {
            if dispatcher.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
        debug!("Notifier stopped");
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(shared: Arc<Shared>, id: usize) {
    let mut state = lock(&shared.state);
    // Consecutive requeues without a dispatch. Once it covers the whole
    // queue every pending destination is busy and the thread backs off.
    let mut skipped = 0usize;

    loop {
        while state.queue.is_empty() && state.running {
            state = shared
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        let Some(notification) = state.queue.pop_front() else {
            debug!(dispatcher = id, "Dispatcher exiting");
            return;
        };

        let busy = state.busy.entry(notification.token).or_insert(false);
        if *busy {
            state.queue.push_back(notification);
            skipped += 1;
            if skipped >= state.queue.len() {
                skipped = 0;
                state = shared
                    .changed
                    .wait_timeout(state, RETRY_DELAY)
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .0;
            }
            continue;
        }
        *busy = true;
        skipped = 0;
        drop(state);

        let token = notification.token;
        let task_shared = Arc::clone(&shared);
        let accepted = shared.pool.execute(move || send_task(task_shared, notification));
        if !accepted {
            warn!(token = token.0, "Worker pool rejected notification");
            release(&shared, token);
        }

        state = lock(&shared.state);
    }
}

/// Clears the busy mark of its connection when dropped.
struct BusyGuard<'a> {
    shared: &'a Shared,
    token: Token,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        release(self.shared, self.token);
    }
}

fn send_task(shared: Arc<Shared>, notification: Notification) {
    let _guard = BusyGuard {
        shared: &shared,
        token: notification.token,
    };
    let frame = notification.message.to_bytes();
    trace!(
        token = notification.token.0,
        status = %notification.message.status,
        len = frame.len(),
        "Sending notification"
    );
    shared.outbox.send(notification.token, frame);
}

fn release(shared: &Shared, token: Token) {
    let mut state = lock(&shared.state);
    // Entries only live while work for the connection is queued or in
    // flight; tokens are never reused.
    if state.queue.iter().any(|n| n.token == token) {
        if let Some(busy) = state.busy.get_mut(&token) {
            *busy = false;
        }
    } else {
        state.busy.remove(&token);
    }
    drop(state);
    shared.changed.notify_all();
}
