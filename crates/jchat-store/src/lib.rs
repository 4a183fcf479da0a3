//! # jchat-store
//!
//! On-disk collaborators of the chat server:
//!
//! - [`OfflineLog`]: one append-only record log per recipient, holding
//!   messages that arrived while the recipient was signed out. The whole log
//!   is read and truncated when the recipient next signs in.
//! - [`FileStore`]: uploaded files, one directory per sender/receiver pair.
//!
//! Both are synchronous; they are only ever called from worker threads.

pub mod files;
pub mod offline;

mod error;

pub use error::{Result, StoreError};
pub use files::FileStore;
pub use offline::{OfflineLog, OfflineRecord};
