use jchat_shared::constants::headers;
use jchat_shared::types::split_names;
use jchat_shared::{Message, StatusCode};
use jchat_store::OfflineRecord;
use mio::Token;
use tracing::{debug, error};

use super::{accepted, required, ChatService};
use crate::error::RequestError;
use crate::registry::Delivery;

impl ChatService {
    pub(super) fn direct_request(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        match request.status {
            StatusCode::SEND_MESSAGE => self.send_message(token, request),
            other => Err(RequestError::Unsupported(other)),
        }
    }

    /// Direct message to one or more peers. Online peers get a 150
    /// notification, offline ones an entry in their offline log.
    fn send_message(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        let sender = required(request, headers::USER)?;
        let peer_list = required(request, headers::PEER)?;
        let time = required(request, headers::TIME)?;
        required(request, headers::CONTENT_LENGTH)?;
        self.authenticate(token, sender)?;

        let peers = split_names(peer_list);
        if peers.is_empty() {
            return Err(RequestError::MissingHeader(headers::PEER));
        }
        if let Some(unknown) = peers.iter().find(|p| !self.registry.user_exists(p)) {
            return Err(RequestError::NoSuchUser(unknown.clone()));
        }

        for peer in &peers {
            let notice = Message::notification(StatusCode::MESSAGE_NOTICE)
                .with_header(headers::TIME, time)
                .with_header(headers::SENDER, sender)
                .with_header(headers::RECEIVER, peer.as_str())
                .with_body(request.body.clone());
            let record = OfflineRecord {
                time: time.to_string(),
                sender: sender.to_string(),
                receiver: peer.clone(),
                body: request.body.clone(),
            };
            match self.registry.route_message(peer, sender, &record) {
                Delivery::Online(session) => {
                    self.notifier.notify(session, notice);
                    debug!(sender, peer = %peer, size = request.body.len(), "Relayed message");
                }
                Delivery::Offline(Ok(())) => {
                    debug!(sender, peer = %peer, "Stored message for offline user")
                }
                Delivery::Offline(Err(e)) => {
                    error!(sender, peer = %peer, error = %e, "Failed to store offline message")
                }
            }
        }

        Ok(accepted(StatusCode::SEND_MESSAGE_RESULT))
    }
}
