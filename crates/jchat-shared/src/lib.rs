//! # jchat-shared
//!
//! Wire model shared by the jchat server and its tools: the [`Message`]
//! record, status codes, header names, and the streaming [`Decoder`] that
//! reassembles messages from a fragmented TCP byte stream.

pub mod codec;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use codec::Decoder;
pub use error::ProtocolError;
pub use protocol::{Category, Headers, Message, Method, StatusCode};
