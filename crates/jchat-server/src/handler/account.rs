//! Sign-up, sign-in (with the offline drain) and sign-out.

use bytes::{BufMut, BytesMut};
use jchat_shared::constants::{headers, reasons, DRAIN_FIELD_SEPARATOR};
use jchat_shared::{Message, StatusCode};
use jchat_store::OfflineRecord;
use mio::Token;
use tracing::{debug, error, info};

use super::{accepted, required, valid_name, ChatService};
use crate::error::RequestError;

impl ChatService {
    pub(super) fn account_request(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        match request.status {
            StatusCode::SIGN_UP => self.sign_up(token, request),
            StatusCode::SIGN_IN => self.sign_in(token, request),
            StatusCode::SIGN_OUT => self.sign_out(token, request),
            other => Err(RequestError::Unsupported(other)),
        }
    }

    fn sign_up(&self, token: Token, request: &Message) -> Result<Message, RequestError> {
        let user = required(request, headers::USER)?;
        let password = required(request, headers::PASSWORD)?;
        valid_name(user)?;

        self.registry.set_short_role(token, user);
        if !self.registry.insert_user(user, password) {
            return Err(RequestError::Wrong(reasons::DUP_USER));
        }
        info!(token = token.0, user, "Signed up");
        Ok(accepted(StatusCode::SIGN_UP_RESULT))
    }

    fn sign_in(&self, token: Token, request: &Message) -> Result<Message, RequestError> {
        let user = required(request, headers::USER)?;
        let password = required(request, headers::PASSWORD)?;

        let stored = self
            .registry
            .password_of(user)
            .ok_or_else(|| RequestError::NoSuchUser(user.to_string()))?;
        if stored != password {
            return Err(RequestError::Wrong(reasons::WRONG_PASSWORD));
        }
        if self.registry.long_role(token).is_some() || !self.registry.try_sign_in(user, token) {
            return Err(RequestError::Wrong(reasons::REPEAT_LOGIN));
        }
        self.registry.promote(token, user);
        info!(token = token.0, user, online = self.registry.online_count(), "Signed in");

        let mut response = accepted(StatusCode::SIGN_IN_RESULT);
        self.drain_pending(user, &mut response);
        Ok(response)
    }

    fn sign_out(&self, token: Token, request: &Message) -> Result<Message, RequestError> {
        let user = required(request, headers::USER)?;

        match self.registry.session_of(user) {
            Some(session) if session == token => {
                self.registry.end_session(user, token);
                self.registry.clear_long_role(token);
                info!(token = token.0, user, "Signed out");
            }
            Some(_) => return Err(RequestError::NotSignedIn(user.to_string())),
            None if !self.registry.user_exists(user) => {
                return Err(RequestError::NoSuchUser(user.to_string()))
            }
            None => {}
        }
        Ok(accepted(StatusCode::SIGN_OUT_RESULT))
    }

    /// Attach everything that piled up while `user` was offline.
    fn drain_pending(&self, user: &str, response: &mut Message) {
        let groups: Vec<String> = self
            .registry
            .take_offline_groups(user)
            .into_iter()
            .map(|group| {
                let mut entry = group.clone();
                if let Some(members) = self.registry.group_members(&group) {
                    for member in members {
                        entry.push(DRAIN_FIELD_SEPARATOR);
                        entry.push_str(&member);
                    }
                }
                entry
            })
            .collect();
        if !groups.is_empty() {
            response.set_header(headers::GROUP, groups.join(" "));
        }

        let files: Vec<String> = self
            .registry
            .take_offline_files(user)
            .into_iter()
            .map(|file| {
                format!(
                    "{}{sep}{}{sep}{}",
                    file.file_name,
                    file.sender,
                    file.time,
                    sep = DRAIN_FIELD_SEPARATOR
                )
            })
            .collect();
        if !files.is_empty() {
            response.set_header(headers::FILES, files.join(" "));
        }

        let pending = self.registry.pending_offline(user);
        if !pending.is_empty() {
            debug!(
                user,
                sources = pending.len(),
                messages = pending.values().sum::<usize>(),
                "Offline messages pending"
            );
        }
        match self.registry.drain_offline_messages(user) {
            Ok(records) if !records.is_empty() => {
                response.set_header(headers::OFFLINE, records.len().to_string());
                response.set_body(encode_records(&records));
            }
            Ok(_) => {}
            Err(e) => error!(user, error = %e, "Failed to drain offline messages"),
        }
    }
}

/// Offline records as carried in the sign-in response body.
fn encode_records(records: &[OfflineRecord]) -> BytesMut {
    let mut body = BytesMut::new();
    for record in records {
        body.put_slice(format!("time: {}\r\n", record.time).as_bytes());
        body.put_slice(format!("sender: {}\r\n", record.sender).as_bytes());
        body.put_slice(format!("receiver: {}\r\n", record.receiver).as_bytes());
        body.put_slice(format!("len: {}\r\n", record.body.len()).as_bytes());
        body.put_slice(&record.body);
        body.put_slice(b"\r\n");
    }
    body
}
