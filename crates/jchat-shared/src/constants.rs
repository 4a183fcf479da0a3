/// Version token carried in every initial line
pub const PROTOCOL_VERSION: &str = "JCHAT/1.0";

/// Application name
pub const APP_NAME: &str = "jchat";

/// Line terminator of the initial line, header lines and the blank line
pub const LINE_END: &str = "\r\n";

/// Separator between a header name and its value
pub const HEADER_SEPARATOR: &str = ": ";

/// Default TCP port of the chat server
pub const DEFAULT_PORT: u16 = 8081;

/// Longest initial or header line the decoder buffers before giving up (8 KiB)
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Default upper bound for a declared `Content-Length` (50 MiB)
pub const DEFAULT_MAX_BODY_LEN: usize = 50 * 1024 * 1024;

/// File extension of the per-recipient offline message log
pub const OFFLINE_LOG_EXTENSION: &str = "jchat";

/// Separator used inside the `Group` and `Files` sign-in headers
pub const DRAIN_FIELD_SEPARATOR: char = '$';

/// Header names used by the chat protocol
pub mod headers {
    pub const USER: &str = "User";
    pub const PASSWORD: &str = "Password";
    pub const PEER: &str = "Peer";
    pub const TIME: &str = "Time";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const GROUP: &str = "Group";
    pub const OTHERS: &str = "Others";
    pub const FILE_NAME: &str = "File-Name";
    pub const FILE_SIZE: &str = "File-Size";
    pub const SENDER: &str = "Sender";
    pub const RECEIVER: &str = "Receiver";
    pub const RETURN: &str = "Return";
    pub const WRONG: &str = "Wrong";
    pub const FILES: &str = "Files";
    pub const OFFLINE: &str = "Offline";
}

/// Values of the `Return` header
pub const RETURN_RIGHT: &str = "right";
pub const RETURN_WRONG: &str = "wrong";

/// Reason codes carried in the `Wrong` header
pub mod reasons {
    pub const DUP_USER: &str = "dup_user";
    pub const WRONG_PASSWORD: &str = "pw";
    pub const REPEAT_LOGIN: &str = "repeat_login";
    pub const DUP_GROUP_NAME: &str = "dup_group_name";
    pub const NO_SUCH_GROUP: &str = "no_such_group";
    pub const DUP_FILE_NAME: &str = "dup_file_name";
    pub const NO_SUCH_FILE: &str = "no_such_file";
}
