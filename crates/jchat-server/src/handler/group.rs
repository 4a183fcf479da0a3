use std::collections::BTreeSet;

use jchat_shared::constants::{headers, reasons};
use jchat_shared::types::split_names;
use jchat_shared::{Message, StatusCode};
use jchat_store::OfflineRecord;
use mio::Token;
use tracing::{debug, error, info};

use super::{accepted, required, valid_name, ChatService};
use crate::error::RequestError;
use crate::registry::Delivery;

impl ChatService {
    pub(super) fn group_request(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        match request.status {
            StatusCode::CREATE_GROUP => self.create_group(token, request),
            StatusCode::GROUP_MESSAGE => self.group_message(token, request),
            other => Err(RequestError::Unsupported(other)),
        }
    }

    fn create_group(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        let creator = required(request, headers::USER)?;
        let others = required(request, headers::OTHERS)?;
        let group = required(request, headers::GROUP)?;
        required(request, headers::CONTENT_LENGTH)?;
        self.authenticate(token, creator)?;
        valid_name(group)?;

        let mut members: BTreeSet<String> = split_names(others).into_iter().collect();
        if let Some(unknown) = members.iter().find(|m| !self.registry.user_exists(m)) {
            return Err(RequestError::NoSuchUser(unknown.clone()));
        }
        members.insert(creator.to_string());

        if !self.registry.create_group(group, members.clone()) {
            return Err(RequestError::Wrong(reasons::DUP_GROUP_NAME));
        }
        info!(creator, group, members = members.len(), "Group created");

        let member_list = members.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
        for member in members.iter().filter(|m| m.as_str() != creator) {
            let notice = Message::notification(StatusCode::GROUP_CREATED_NOTICE)
                .with_header(headers::GROUP, group)
                .with_header(headers::OTHERS, member_list.as_str());
            match self.registry.route_group_notice(member, group) {
                Delivery::Online(session) => self.notifier.notify(session, notice),
                Delivery::Offline(()) => {
                    debug!(group, member = %member, "Group notice kept for offline member")
                }
            }
        }

        Ok(accepted(StatusCode::CREATE_GROUP_RESULT))
    }

    /// Relay to every member except the sender.
    fn group_message(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        let sender = required(request, headers::USER)?;
        let group = required(request, headers::GROUP)?;
        let time = required(request, headers::TIME)?;
        required(request, headers::CONTENT_LENGTH)?;
        self.authenticate(token, sender)?;

        let members = self
            .registry
            .group_members(group)
            .ok_or(RequestError::Wrong(reasons::NO_SUCH_GROUP))?;

        for member in members.iter().filter(|m| m.as_str() != sender) {
            let notice = Message::notification(StatusCode::GROUP_MESSAGE_NOTICE)
                .with_header(headers::TIME, time)
                .with_header(headers::SENDER, sender)
                .with_header(headers::GROUP, group)
                .with_body(request.body.clone());
            let record = OfflineRecord {
                time: time.to_string(),
                sender: sender.to_string(),
                receiver: group.to_string(),
                body: request.body.clone(),
            };
            match self.registry.route_message(member, group, &record) {
                Delivery::Online(session) => self.notifier.notify(session, notice),
                Delivery::Offline(Ok(())) => {}
                Delivery::Offline(Err(e)) => {
                    error!(group, member = %member, error = %e, "Failed to store offline group message")
                }
            }
        }
        debug!(sender, group, recipients = members.len().saturating_sub(1), "Relayed group message");

        Ok(accepted(StatusCode::GROUP_MESSAGE_RESULT))
    }
}
