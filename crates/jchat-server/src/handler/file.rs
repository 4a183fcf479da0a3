use jchat_shared::constants::{headers, reasons};
use jchat_shared::{Message, StatusCode};
use jchat_store::StoreError;
use mio::Token;
use tracing::{error, info};

use super::{accepted, required, valid_name, ChatService};
use crate::error::RequestError;
use crate::registry::{Delivery, PendingFile};

/// Reason sent when the file store fails for a reason the client cannot fix.
const STORE_FAILED: &str = "store_failed";

impl ChatService {
    pub(super) fn file_request(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        match request.status {
            StatusCode::UPLOAD_FILE => self.upload_file(token, request),
            StatusCode::DOWNLOAD_FILE => self.download_file(token, request),
            other => Err(RequestError::Unsupported(other)),
        }
    }

    fn upload_file(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        let sender = required(request, headers::USER)?;
        let peer = required(request, headers::PEER)?;
        let time = required(request, headers::TIME)?;
        required(request, headers::CONTENT_LENGTH)?;
        let file_name = required(request, headers::FILE_NAME)?;
        self.authenticate(token, sender)?;
        valid_name(file_name)?;
        if !self.registry.user_exists(peer) {
            return Err(RequestError::NoSuchUser(peer.to_string()));
        }

        match self.files.store(sender, peer, file_name, &request.body) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(RequestError::Wrong(reasons::DUP_FILE_NAME))
            }
            Err(StoreError::InvalidName(name)) => return Err(RequestError::InvalidName(name)),
            Err(e) => {
                error!(sender, peer, file = file_name, error = %e, "Failed to store upload");
                return Err(RequestError::Wrong(STORE_FAILED));
            }
        }
        info!(sender, peer, file = file_name, size = request.body.len(), "File uploaded");

        let notice = Message::notification(StatusCode::FILE_NOTICE)
            .with_header(headers::TIME, time)
            .with_header(headers::SENDER, sender)
            .with_header(headers::FILE_NAME, file_name)
            .with_header(headers::FILE_SIZE, request.body.len().to_string());
        let pending = PendingFile {
            file_name: file_name.to_string(),
            sender: sender.to_string(),
            time: time.to_string(),
        };
        if let Delivery::Online(session) = self.registry.route_file_notice(peer, pending) {
            self.notifier.notify(session, notice);
        }

        Ok(accepted(StatusCode::UPLOAD_FILE_RESULT))
    }

    fn download_file(
        &self,
        token: Token,
        request: &Message,
    ) -> Result<Message, RequestError> {
        let user = required(request, headers::USER)?;
        let sender = required(request, headers::SENDER)?;
        required(request, headers::CONTENT_LENGTH)?;
        let file_name = required(request, headers::FILE_NAME)?;
        self.authenticate(token, user)?;

        let data = match self.files.load(sender, user, file_name) {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Err(RequestError::Wrong(reasons::NO_SUCH_FILE)),
            Err(StoreError::InvalidName(name)) => return Err(RequestError::InvalidName(name)),
            Err(e) => {
                error!(user, sender, file = file_name, error = %e, "Failed to read upload");
                return Err(RequestError::Wrong(STORE_FAILED));
            }
        };
        info!(user, sender, file = file_name, size = data.len(), "File downloaded");

        Ok(accepted(StatusCode::DOWNLOAD_FILE_RESULT).with_body(data))
    }
}
