//! Request handling.
//!
//! [`ChatService::handle`] runs on a worker thread with one decoded message.
//! Requests are routed by the first digit of their status code to the
//! per-family modules, each of which returns either the success response or
//! a [`RequestError`] that is turned into the matching error answer here. Notifications produced while
//! handling go through the [`Notifier`] before the response is sent.

mod account;
mod direct;
mod file;
mod group;

use std::sync::Arc;

use jchat_shared::constants::{headers, RETURN_RIGHT, RETURN_WRONG};
use jchat_shared::types::is_valid_name;
use jchat_shared::{Category, Message, Method, StatusCode};
use jchat_store::FileStore;
use mio::Token;
use tracing::{debug, warn};

use crate::error::RequestError;
use crate::notify::Notifier;
use crate::outbox::Outbox;
use crate::registry::Registry;

pub struct ChatService {
    registry: Arc<Registry>,
    files: FileStore,
    notifier: Arc<Notifier>,
    outbox: Arc<dyn Outbox>,
}

impl ChatService {
    pub fn new(
        registry: Arc<Registry>,
        files: FileStore,
        notifier: Arc<Notifier>,
        outbox: Arc<dyn Outbox>,
    ) -> Self {
        Self {
            registry,
            files,
            notifier,
            outbox,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one message from the connection behind `token`.
    pub fn handle(&self, token: Token, message: Message) {
        match message.method {
            Method::Req => {
                let response = self.respond(token, &message);
                self.outbox.send(token, response.to_bytes());
            }
            Method::Res => {
                debug!(token = token.0, status = %message.status, "Discarding response sent by client");
            }
            Method::Inf => {
                warn!(token = token.0, status = %message.status, "Client sent a notification");
                self.outbox
                    .send(token, Message::response(StatusCode::MALFORMED).to_bytes());
            }
        }
    }

    /// Release everything tied to a closed connection.
    pub fn disconnect(&self, token: Token) {
        if let Some(user) = self.registry.disconnect(token) {
            debug!(token = token.0, user = %user, "Signed-in connection closed");
        }
        self.notifier.forget(token);
    }

    fn respond(&self, token: Token, request: &Message) -> Message {
        let Some(result) = result_status(request.status) else {
            warn!(token = token.0, status = %request.status, "Unsupported request");
            return Message::response(StatusCode::MALFORMED);
        };

        let outcome = match request.status.category() {
            Category::Account => self.account_request(token, request),
            Category::DirectMessage => self.direct_request(token, request),
            Category::Group => self.group_request(token, request),
            Category::File => self.file_request(token, request),
            Category::Error | Category::Unknown => Err(RequestError::Unsupported(request.status)),
        };

        match outcome {
            Ok(response) => response,
            Err(e) => {
                debug!(token = token.0, status = %request.status, error = %e, "Request refused");
                refusal(result, &e)
            }
        }
    }

    /// The user must be signed in, and on this very connection.
    fn authenticate(&self, token: Token, user: &str) -> Result<(), RequestError> {
        match self.registry.session_of(user) {
            Some(session) if session == token => Ok(()),
            _ => Err(RequestError::NotSignedIn(user.to_string())),
        }
    }
}

/// Result status answering `request`, for the requests the server knows.
fn result_status(request: StatusCode) -> Option<StatusCode> {
    match request {
        StatusCode::SIGN_UP
        | StatusCode::SIGN_IN
        | StatusCode::SIGN_OUT
        | StatusCode::SEND_MESSAGE
        | StatusCode::CREATE_GROUP
        | StatusCode::GROUP_MESSAGE
        | StatusCode::UPLOAD_FILE
        | StatusCode::DOWNLOAD_FILE => StatusCode::new(request.code() + 1),
        _ => None,
    }
}

fn accepted(result: StatusCode) -> Message {
    Message::response(result).with_header(headers::RETURN, RETURN_RIGHT)
}

fn refusal(result: StatusCode, error: &RequestError) -> Message {
    match (error.status(), error) {
        (Some(status), _) => Message::response(status),
        (None, RequestError::Wrong(reason)) => Message::response(result)
            .with_header(headers::RETURN, RETURN_WRONG)
            .with_header(headers::WRONG, *reason),
        (None, _) => Message::response(StatusCode::MALFORMED),
    }
}

fn required<'m>(message: &'m Message, name: &'static str) -> Result<&'m str, RequestError> {
    message
        .header(name)
        .ok_or(RequestError::MissingHeader(name))
}

fn valid_name(name: &str) -> Result<(), RequestError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(RequestError::InvalidName(name.to_string()))
    }
}
