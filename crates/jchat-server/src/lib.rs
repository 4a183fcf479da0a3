//! # jchat-server
//!
//! Multi-client chat server over a line-oriented text protocol.
//!
//! - **Reactor** (mio) owns every socket on one thread and decodes requests
//!   as bytes arrive, however TCP splits or merges them
//! - **Worker pool** runs request handlers, one connection's requests in
//!   arrival order
//! - **Notifier** serializes server-initiated messages per connection
//! - **Registry** keeps accounts, sessions, groups and offline deliveries
//!
//! [`ChatServer`] wires them together.

mod acceptor;
mod connection;
mod io;

pub mod config;
pub mod error;
pub mod handler;
pub mod notify;
pub mod outbox;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod sink;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::ServerConfig;
pub use error::{RequestError, ServerError};
pub use outbox::ReactorHandle;
pub use server::ChatServer;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
/// Every critical section leaves its map consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
