//! Shared chat state: accounts, sessions, connection roles, groups and the
//! pending offline deliveries.
//!
//! Every map sits behind its own mutex. Most operations take exactly one
//! lock; when a second one is needed it is taken only after the first has
//! been released, or (for the offline message log) in this order:
//!
//! `users` → `online` → `short_roles` → `long_roles` → `groups` →
//! `offline_messages` → `offline_groups` → `offline_files`
//!
//! Check-then-insert sequences (sign-up, sign-in, group creation) run under
//! a single lock so two racing requests cannot both succeed.
//!
//! Items for a user who may be offline go through the `route_*` methods.
//! They hold the `online` lock while deciding and while storing, and
//! [`Registry::try_sign_in`] takes the same lock, so an item is either
//! handed to the new session or stored before it exists and picked up by
//! the sign-in drain.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use jchat_store::{OfflineLog, OfflineRecord, Result as StoreResult};
use mio::Token;
use tracing::{debug, info};

use crate::lock;

/// A file waiting to be announced to its receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub file_name: String,
    pub sender: String,
    pub time: String,
}

/// Outcome of routing an item to a user.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    /// The user is signed in on this connection; notify it.
    Online(Token),
    /// The user is offline; the item was kept, with the store's result.
    Offline(T),
}

pub struct Registry {
    /// user → password
    users: Mutex<HashMap<String, String>>,
    /// signed-in user → connection
    online: Mutex<HashMap<String, Token>>,
    /// connection → user, for connections that only signed up
    short_roles: Mutex<HashMap<Token, String>>,
    /// connection → user, for signed-in connections
    long_roles: Mutex<HashMap<Token, String>>,
    /// group → members
    groups: Mutex<HashMap<String, BTreeSet<String>>>,
    /// recipient → (sender or group → pending count); guards `log`
    offline_messages: Mutex<HashMap<String, HashMap<String, usize>>>,
    /// user → groups created while they were offline
    offline_groups: Mutex<HashMap<String, BTreeSet<String>>>,
    /// user → files uploaded for them while they were offline
    offline_files: Mutex<HashMap<String, Vec<PendingFile>>>,
    log: OfflineLog,
}

impl Registry {
    pub fn new(log: OfflineLog) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
            short_roles: Mutex::new(HashMap::new()),
            long_roles: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            offline_messages: Mutex::new(HashMap::new()),
            offline_groups: Mutex::new(HashMap::new()),
            offline_files: Mutex::new(HashMap::new()),
            log,
        }
    }

    // ----- accounts -----

    /// Create an account. Returns `false` if the name is taken.
    pub fn insert_user(&self, name: &str, password: &str) -> bool {
        let mut users = lock(&self.users);
        if users.contains_key(name) {
            return false;
        }
        users.insert(name.to_string(), password.to_string());
        info!(user = name, total = users.len(), "Account created");
        true
    }

    pub fn user_exists(&self, name: &str) -> bool {
        lock(&self.users).contains_key(name)
    }

    pub fn password_of(&self, name: &str) -> Option<String> {
        lock(&self.users).get(name).cloned()
    }

    // ----- sessions -----

    /// Bind `name` to `token` unless the user already has a session.
    pub fn try_sign_in(&self, name: &str, token: Token) -> bool {
        let mut online = lock(&self.online);
        if online.contains_key(name) {
            return false;
        }
        online.insert(name.to_string(), token);
        true
    }

    pub fn session_of(&self, name: &str) -> Option<Token> {
        lock(&self.online).get(name).copied()
    }

    /// Run `keep` unless `name` has a session, holding the `online` lock
    /// throughout.
    fn online_or<T>(&self, name: &str, keep: impl FnOnce() -> T) -> Delivery<T> {
        let online = lock(&self.online);
        match online.get(name) {
            Some(token) => Delivery::Online(*token),
            None => Delivery::Offline(keep()),
        }
    }

    /// Remove the session of `name` only if it belongs to `token`.
    pub fn end_session(&self, name: &str, token: Token) -> bool {
        let mut online = lock(&self.online);
        if online.get(name) == Some(&token) {
            online.remove(name);
            true
        } else {
            false
        }
    }

    pub fn online_count(&self) -> usize {
        lock(&self.online).len()
    }

    // ----- connection roles -----

    pub fn set_short_role(&self, token: Token, name: &str) {
        lock(&self.short_roles).insert(token, name.to_string());
    }

    /// Record that `token` is now signed in as `name`.
    pub fn promote(&self, token: Token, name: &str) {
        lock(&self.short_roles).remove(&token);
        lock(&self.long_roles).insert(token, name.to_string());
    }

    pub fn long_role(&self, token: Token) -> Option<String> {
        lock(&self.long_roles).get(&token).cloned()
    }

    pub fn clear_long_role(&self, token: Token) -> Option<String> {
        lock(&self.long_roles).remove(&token)
    }

    /// Drop everything tied to a closed connection. Returns the user that
    /// was signed in on it, if any.
    pub fn disconnect(&self, token: Token) -> Option<String> {
        let signed_in = self.clear_long_role(token);
        lock(&self.short_roles).remove(&token);
        if let Some(name) = &signed_in {
            if self.end_session(name, token) {
                info!(user = %name, token = token.0, "Session closed with connection");
            }
        }
        signed_in
    }

    // ----- groups -----

    /// Create a group. Returns `false` if the name is taken.
    pub fn create_group(&self, name: &str, members: BTreeSet<String>) -> bool {
        let mut groups = lock(&self.groups);
        if groups.contains_key(name) {
            return false;
        }
        info!(group = name, members = members.len(), "Group created");
        groups.insert(name.to_string(), members);
        true
    }

    pub fn group_members(&self, name: &str) -> Option<BTreeSet<String>> {
        lock(&self.groups).get(name).cloned()
    }

    // ----- offline messages -----

    /// Deliver to the session of `recipient`, or persist `record` if they
    /// are offline.
    pub fn route_message(
        &self,
        recipient: &str,
        key: &str,
        record: &OfflineRecord,
    ) -> Delivery<StoreResult<()>> {
        self.online_or(recipient, || self.store_offline_message(recipient, key, record))
    }

    /// Persist `record` for `recipient` and count it under `key` (the
    /// sender for direct messages, the group for group messages).
    fn store_offline_message(
        &self,
        recipient: &str,
        key: &str,
        record: &OfflineRecord,
    ) -> StoreResult<()> {
        let mut index = lock(&self.offline_messages);
        self.log.append(recipient, record)?;
        *index
            .entry(recipient.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Take every stored message for `recipient` and clear its index.
    ///
    /// The log is read even when the in-memory index has no entry, so
    /// messages persisted by an earlier process are delivered too.
    pub fn drain_offline_messages(&self, recipient: &str) -> StoreResult<Vec<OfflineRecord>> {
        let mut index = lock(&self.offline_messages);
        let records = self.log.drain(recipient)?;
        index.remove(recipient);
        if !records.is_empty() {
            debug!(recipient, count = records.len(), "Drained offline messages");
        }
        Ok(records)
    }

    /// Pending message counts for `recipient`, keyed by sender or group.
    pub fn pending_offline(&self, recipient: &str) -> HashMap<String, usize> {
        lock(&self.offline_messages)
            .get(recipient)
            .cloned()
            .unwrap_or_default()
    }

    // ----- offline group notices -----

    /// Announce `group` to the session of `user`, or keep it for their
    /// next sign-in.
    pub fn route_group_notice(&self, user: &str, group: &str) -> Delivery<()> {
        self.online_or(user, || self.add_offline_group(user, group))
    }

    fn add_offline_group(&self, user: &str, group: &str) {
        lock(&self.offline_groups)
            .entry(user.to_string())
            .or_default()
            .insert(group.to_string());
    }

    pub fn take_offline_groups(&self, user: &str) -> BTreeSet<String> {
        lock(&self.offline_groups).remove(user).unwrap_or_default()
    }

    // ----- offline file notices -----

    /// Announce `file` to the session of `user`, or keep it for their next
    /// sign-in.
    pub fn route_file_notice(&self, user: &str, file: PendingFile) -> Delivery<()> {
        self.online_or(user, || self.add_offline_file(user, file))
    }

    fn add_offline_file(&self, user: &str, file: PendingFile) {
        lock(&self.offline_files)
            .entry(user.to_string())
            .or_default()
            .push(file);
    }

    pub fn take_offline_files(&self, user: &str) -> Vec<PendingFile> {
        lock(&self.offline_files).remove(user).unwrap_or_default()
    }
}
