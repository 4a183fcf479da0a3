//! Streaming decoder and encoder for the line-delimited wire format.
//!
//! ```text
//! <METHOD> <STATUS> <VERSION>\r\n
//! <Header-Name>: <Header-Value>\r\n      (zero or more)
//! \r\n
//! <body, exactly Content-Length bytes>
//! ```
//!
//! TCP delivers this stream in arbitrary pieces: one read may end in the
//! middle of a header line, another may hold the tail of one message and the
//! start of the next. The [`Decoder`] keeps its partial progress between
//! calls and only ever consumes bytes it has fully validated, so whatever is
//! left in the buffer belongs to the next stage or the next message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::constants::{headers, DEFAULT_MAX_BODY_LEN, HEADER_SEPARATOR, LINE_END, MAX_LINE_LEN};
use crate::error::ProtocolError;
use crate::protocol::{Headers, Message, Method, StatusCode};

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Append the wire form of `message` to `dst`.
///
/// Headers are written as stored; builders on [`Message`] keep
/// `Content-Length` in step with the body.
pub fn encode(message: &Message, dst: &mut BytesMut) {
    dst.reserve(message.encoded_len());

    dst.put_slice(message.method.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(message.status.to_string().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(message.version.as_bytes());
    dst.put_slice(LINE_END.as_bytes());

    for (name, value) in &message.headers {
        dst.put_slice(name.as_bytes());
        dst.put_slice(HEADER_SEPARATOR.as_bytes());
        dst.put_slice(value.as_bytes());
        dst.put_slice(LINE_END.as_bytes());
    }

    dst.put_slice(LINE_END.as_bytes());
    dst.put_slice(&message.body);
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Initial line and headers, parsed once the blank line has been seen.
#[derive(Debug)]
struct Head {
    method: Method,
    status: StatusCode,
    version: String,
    headers: Headers,
    content_length: usize,
}

/// Progress on the message currently being assembled.
#[derive(Debug, Default)]
struct Partial {
    initial_line: Option<String>,
    header_lines: Vec<String>,
    headers_complete: bool,
    /// A line of the head was not UTF-8; reported once the head is complete.
    invalid_utf8: bool,
    head: Option<Head>,
    body: BytesMut,
}

/// Resumable decoder for one connection's inbound byte stream.
#[derive(Debug)]
pub struct Decoder {
    max_line_len: usize,
    max_body_len: usize,
    partial: Partial,
    /// Body bytes of a rejected message still to be skipped.
    discard: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_limits(MAX_LINE_LEN, DEFAULT_MAX_BODY_LEN)
    }

    pub fn with_limits(max_line_len: usize, max_body_len: usize) -> Self {
        Self {
            max_line_len,
            max_body_len,
            partial: Partial::default(),
            discard: 0,
        }
    }

    /// `true` when no part of a message has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.partial.initial_line.is_none() && self.discard == 0
    }

    /// Try to complete one message from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; progress is kept and
    /// the next call resumes where this one stopped. Callers loop until
    /// `Ok(None)` because `src` may hold several messages.
    ///
    /// Non-fatal errors are reported once the whole head (up to the blank
    /// line) has been consumed. The body the rejected message declared is
    /// then skipped, across later calls if needed, so the next message
    /// starts on a fresh initial line.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if !self.skip_discarded(src) {
            return Ok(None);
        }
        let result = self.advance(src);
        if let Err(err) = &result {
            if !err.is_fatal() && self.partial.headers_complete {
                self.discard = self.declared_length();
                trace!(discard = self.discard, "Skipping body of rejected message");
            }
            self.partial = Partial::default();
            self.skip_discarded(src);
        }
        result
    }

    /// Drop pending discard bytes from `src`; `true` once none remain.
    fn skip_discarded(&mut self, src: &mut BytesMut) -> bool {
        let take = self.discard.min(src.len());
        src.advance(take);
        self.discard -= take;
        self.discard == 0
    }

    /// `Content-Length` of the current head, as far as it can be trusted.
    fn declared_length(&self) -> usize {
        self.partial
            .header_lines
            .iter()
            .filter_map(|line| split_header(line).ok())
            .filter(|(name, _)| *name == headers::CONTENT_LENGTH)
            .filter_map(|(_, value)| value.trim().parse::<usize>().ok())
            .last()
            .filter(|len| *len <= self.max_body_len)
            .unwrap_or(0)
    }

    fn advance(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        // 1. Initial line
        if self.partial.initial_line.is_none() {
            match self.take_line(src)? {
                Some(line) => self.partial.initial_line = Some(line),
                None => return Ok(None),
            }
        }

        // 2. Header lines up to the blank line
        while !self.partial.headers_complete {
            match self.take_line(src)? {
                Some(line) if line.is_empty() => self.partial.headers_complete = true,
                Some(line) => self.partial.header_lines.push(line),
                None => return Ok(None),
            }
        }

        // 3. Parse initial line and headers, once per message
        if self.partial.head.is_none() {
            let head = self.parse_head()?;
            self.partial.body.reserve(head.content_length);
            self.partial.head = Some(head);
        }

        let required = match &self.partial.head {
            Some(head) => head.content_length,
            None => return Ok(None),
        };

        // 4. Body
        let missing = required - self.partial.body.len();
        if missing > 0 {
            let take = missing.min(src.len());
            self.partial.body.put(src.split_to(take));
            trace!(
                received = self.partial.body.len(),
                declared = required,
                "Body bytes buffered"
            );
        }

        // 5. Completion
        if self.partial.body.len() < required {
            return Ok(None);
        }

        let partial = std::mem::take(&mut self.partial);
        let Some(head) = partial.head else {
            return Ok(None);
        };
        Ok(Some(Message {
            method: head.method,
            status: head.status,
            version: head.version,
            headers: head.headers,
            body: partial.body.freeze(),
        }))
    }

    /// Remove one `\r\n`-terminated line from the front of `src`, without
    /// its terminator. `None` when the terminator has not arrived yet.
    fn take_line(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        let Some(pos) = find_line_end(src) else {
            if src.len() > self.max_line_len {
                return Err(ProtocolError::LineTooLong {
                    max: self.max_line_len,
                });
            }
            return Ok(None);
        };
        if pos > self.max_line_len {
            return Err(ProtocolError::LineTooLong {
                max: self.max_line_len,
            });
        }

        let line = src.split_to(pos);
        src.advance(LINE_END.len());
        match String::from_utf8(line.to_vec()) {
            Ok(line) => Ok(Some(line)),
            Err(err) => {
                self.partial.invalid_utf8 = true;
                Ok(Some(String::from_utf8_lossy(err.as_bytes()).into_owned()))
            }
        }
    }

    fn parse_head(&self) -> Result<Head, ProtocolError> {
        if self.partial.invalid_utf8 {
            return Err(ProtocolError::InvalidUtf8);
        }
        let initial = self.partial.initial_line.as_deref().unwrap_or_default();
        let parts: Vec<&str> = initial.split_ascii_whitespace().collect();
        let [method, status, version] = parts.as_slice() else {
            return Err(ProtocolError::MalformedInitialLine(initial.to_string()));
        };
        let method: Method = method.parse()?;
        let status: StatusCode = status.parse()?;

        let mut map = Headers::new();
        for line in &self.partial.header_lines {
            let (name, value) = split_header(line)?;
            map.insert(name.to_string(), value.to_string());
        }

        let content_length = match map.get(headers::CONTENT_LENGTH) {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidContentLength(raw.clone()))?,
            None => 0,
        };
        if content_length > self.max_body_len {
            return Err(ProtocolError::BodyTooLarge {
                size: content_length,
                max: self.max_body_len,
            });
        }

        Ok(Head {
            method,
            status,
            version: version.to_string(),
            headers: map,
            content_length,
        })
    }
}

/// Split `Name: value` on the first separator; both halves must be non-empty.
fn split_header(line: &str) -> Result<(&str, &str), ProtocolError> {
    match line.split_once(HEADER_SEPARATOR) {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => Ok((name, value)),
        _ => Err(ProtocolError::MalformedHeader(line.to_string())),
    }
}

fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == LINE_END.as_bytes())
}

/// Decode every complete message in `src`, for callers that hold a whole
/// buffer (tests, replay tools).
pub fn decode_all(
    decoder: &mut Decoder,
    src: &mut BytesMut,
) -> Result<Vec<Message>, ProtocolError> {
    let mut out = Vec::new();
    while let Some(message) = decoder.decode(src)? {
        out.push(message);
    }
    Ok(out)
}

/// Convenience for one-shot encoding of several messages back to back.
pub fn encode_all<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Bytes {
    let mut dst = BytesMut::new();
    for message in messages {
        encode(message, &mut dst);
    }
    dst.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sample(body: &[u8]) -> Message {
        Message::request(StatusCode::SEND_MESSAGE)
            .with_header(headers::USER, "alice")
            .with_header(headers::PEER, "bob carol")
            .with_header(headers::TIME, "2024-01-01 10:00:00")
            .with_body(Bytes::copy_from_slice(body))
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Message> {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            out.extend(decode_all(&mut decoder, &mut buf).unwrap());
        }
        assert!(buf.is_empty(), "decoder left {} bytes behind", buf.len());
        out
    }

    #[test]
    fn test_decode_whole_message() {
        let msg = sample(b"hi bob");
        let decoded = decode_chunks(&[&msg.to_bytes()]);
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_fragmentation_at_every_split_point() {
        let msg = sample(b"line one\r\nline two\r\n\r\nthree");
        let wire = msg.to_bytes();
        for split in 1..wire.len() {
            let (a, b) = wire.split_at(split);
            let decoded = decode_chunks(&[a, b]);
            assert_eq!(decoded, vec![msg.clone()], "split at {split}");
        }
    }

    #[test]
    fn test_fragmentation_random_chunks() {
        let msg = sample(&[7u8; 300]);
        let wire = msg.to_bytes();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut rest: &[u8] = &wire;
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(40));
                let (head, tail) = rest.split_at(n);
                chunks.push(head);
                rest = tail;
            }
            assert_eq!(decode_chunks(&chunks), vec![msg.clone()]);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let msg = sample(b"slow");
        let wire = msg.to_bytes();
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), vec![msg]);
    }

    #[test]
    fn test_coalesced_messages_in_one_read() {
        let msgs = vec![
            sample(b"first"),
            Message::request(StatusCode::SIGN_IN)
                .with_header(headers::USER, "bob")
                .with_header(headers::PASSWORD, "pw"),
            sample(b""),
            sample(b"last"),
        ];
        let wire = encode_all(&msgs);
        assert_eq!(decode_chunks(&[&wire]), msgs);
    }

    #[test]
    fn test_message_plus_fragment_of_next() {
        let first = sample(b"one");
        let second = sample(b"two");
        let wire = encode_all([&first, &second]);
        let cut = first.encoded_len() + 7;

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&wire[..cut]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(!decoder.is_idle());

        buf.extend_from_slice(&wire[cut..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_body_split_across_reads_keeps_remainder() {
        let msg = sample(b"0123456789");
        let wire = msg.to_bytes();
        let header_len = wire.len() - 10;

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&wire[..header_len + 4]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(&wire[header_len + 4..]);
        buf.extend_from_slice(b"REQ 020");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
        assert_eq!(&buf[..], b"REQ 020");
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let raw = b"RES 021 JCHAT/1.0\r\nReturn: right\r\nContent-Length: 3\r\nOffline: 1\r\n\r\nabc";
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&raw[..]);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();

        let mut again = BytesMut::from(&msg.to_bytes()[..]);
        let reparsed = Decoder::new().decode(&mut again).unwrap().unwrap();
        assert_eq!(reparsed, msg);
        assert_eq!(reparsed.method, Method::Res);
        assert_eq!(reparsed.status, StatusCode::SIGN_IN_RESULT);
        assert_eq!(reparsed.header("Offline"), Some("1"));
        assert_eq!(&reparsed.body[..], b"abc");
    }

    #[test]
    fn test_duplicate_header_overwrites() {
        let raw = b"REQ 010 JCHAT/1.0\r\nUser: a\r\nUser: b\r\n\r\n";
        let msg = Decoder::new()
            .decode(&mut BytesMut::from(&raw[..]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.header("User"), Some("b"));
    }

    #[test]
    fn test_missing_content_length_means_empty_body() {
        let raw = b"REQ 010 JCHAT/1.0\r\nUser: a\r\nPassword: b\r\n\r\nREQ";
        let mut buf = BytesMut::from(&raw[..]);
        let msg = Decoder::new().decode(&mut buf).unwrap().unwrap();
        assert!(msg.body.is_empty());
        assert!(msg.header(headers::CONTENT_LENGTH).is_none());
        assert_eq!(&buf[..], b"REQ");
    }

    #[test]
    fn test_header_value_may_contain_separator() {
        let raw = b"REQ 110 JCHAT/1.0\r\nTime: 10: 30: 00\r\n\r\n";
        let msg = Decoder::new()
            .decode(&mut BytesMut::from(&raw[..]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.header("Time"), Some("10: 30: 00"));
    }

    #[test]
    fn test_malformed_header_then_recovery() {
        let good = sample(b"ok");
        let mut wire = BytesMut::from(&b"REQ 110 JCHAT/1.0\r\nbroken-line\r\n\r\n"[..]);
        wire.extend_from_slice(&good.to_bytes());

        let mut decoder = Decoder::new();
        let err = decoder.decode(&mut wire).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
        assert!(!err.is_fatal());
        assert!(decoder.is_idle());
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(good));
    }

    #[test]
    fn test_rejected_message_body_is_skipped() {
        let sign_in = Message::request(StatusCode::SIGN_IN)
            .with_header(headers::USER, "bob")
            .with_header(headers::PASSWORD, "pw");
        let mut wire = BytesMut::from(
            &b"REQ 110 JCHAT/1.0\r\nContent-Length: 5\r\nbroken-line\r\n\r\nhello"[..],
        );
        wire.extend_from_slice(&sign_in.to_bytes());

        let mut decoder = Decoder::new();
        let err = decoder.decode(&mut wire).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(sign_in));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_rejected_body_skipped_across_reads() {
        let good = sample(b"ok");
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"REQ 9x9 JCHAT/1.0\r\nContent-Length: 10\r\n\r\n0123"[..]);
        assert!(matches!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::InvalidStatus(_)
        ));
        assert!(buf.is_empty());
        assert!(!decoder.is_idle());

        buf.extend_from_slice(b"456");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"789");
        buf.extend_from_slice(&good.to_bytes());
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(good));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_invalid_utf8_reported_after_head() {
        let good = sample(b"ok");
        let mut wire = BytesMut::from(&b"REQ 110 JCHAT/1.0\r\nUser: \xff\xfe\r\nContent-Length: 2\r\n\r\nxx"[..]);
        wire.extend_from_slice(&good.to_bytes());

        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&mut wire).unwrap_err(), ProtocolError::InvalidUtf8);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(good));
    }

    fn decode_err(raw: &[u8]) -> ProtocolError {
        Decoder::new()
            .decode(&mut BytesMut::from(raw))
            .unwrap_err()
    }

    #[test]
    fn test_bad_initial_lines() {
        assert!(matches!(
            decode_err(b"REQ 010\r\n\r\n"),
            ProtocolError::MalformedInitialLine(_)
        ));
        assert!(matches!(
            decode_err(b"GET 010 JCHAT/1.0\r\n\r\n"),
            ProtocolError::UnknownMethod(_)
        ));
        assert!(matches!(
            decode_err(b"REQ 10 JCHAT/1.0\r\n\r\n"),
            ProtocolError::InvalidStatus(_)
        ));
        assert!(matches!(
            decode_err(b"REQ 110 JCHAT/1.0\r\nContent-Length: ten\r\n\r\n"),
            ProtocolError::InvalidContentLength(_)
        ));
    }

    #[test]
    fn test_unterminated_line_too_long_is_fatal() {
        let mut decoder = Decoder::with_limits(16, 1024);
        let mut buf = BytesMut::from(&[b'a'; 17][..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::LineTooLong { max: 16 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_oversized_body_is_fatal() {
        let mut decoder = Decoder::with_limits(1024, 4);
        let mut buf = BytesMut::from(&b"REQ 110 JCHAT/1.0\r\nContent-Length: 5\r\n\r\n"[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::BodyTooLarge { size: 5, max: 4 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bare_newline_is_not_a_terminator() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"REQ 010 JCHAT/1.0\n"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 18);
    }
}
