use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jchat_store::{FileStore, OfflineLog};
use mio::Poll;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::ChatService;
use crate::notify::Notifier;
use crate::outbox::ReactorHandle;
use crate::pool::WorkerPool;
use crate::reactor::{Limits, Reactor};
use crate::registry::Registry;
use crate::sink::WorkerSink;

/// A bound, not yet running server.
pub struct ChatServer {
    reactor: Reactor,
    pool: Arc<WorkerPool>,
    notifier: Arc<Notifier>,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    poll_timeout: Duration,
}

impl ChatServer {
    /// Open the on-disk stores, start the worker and notifier threads and
    /// bind the listening socket.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let log = OfflineLog::open(config.data_dir.join("message"))?;
        let files = FileStore::open(config.data_dir.join("files"))?;
        let registry = Arc::new(Registry::new(log));

        let poll = Poll::new()?;
        let (handle, commands) = ReactorHandle::channel(&poll)?;
        let outbox = Arc::new(handle.clone());

        let pool = Arc::new(WorkerPool::new(config.worker_threads));
        let notifier = Arc::new(Notifier::start(
            config.notify_threads,
            Arc::clone(&pool),
            outbox.clone(),
        ));
        let service = Arc::new(ChatService::new(
            Arc::clone(&registry),
            files,
            Arc::clone(&notifier),
            outbox,
        ));
        let sink = Arc::new(WorkerSink::new(service, Arc::clone(&pool)));

        let limits = Limits {
            max_connections: config.max_connections,
            max_line_len: config.max_line_len,
            max_body_len: config.max_body_size,
            outbound_high_water: config.outbound_high_water,
        };
        let mut reactor = Reactor::new(poll, handle, commands, sink, limits, config.max_events);
        let local_addr = reactor.listen(config.listen_addr)?;

        Ok(Self {
            reactor,
            pool,
            notifier,
            registry,
            local_addr,
            poll_timeout: config.poll_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server from another thread.
    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Run the event loop on the calling thread until shut down, then drain
    /// the notifier and the worker pool.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "Chat server running");
        let result = self.reactor.run(self.poll_timeout);
        info!(
            queued = self.pool.queued(),
            notifications = self.notifier.pending(),
            "Draining pending work"
        );
        self.notifier.shutdown();
        self.pool.shutdown();
        info!("Chat server stopped");
        result.map_err(ServerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use jchat_shared::constants::{headers, reasons, RETURN_RIGHT, RETURN_WRONG};
    use jchat_shared::{Decoder, Message, Method, StatusCode};
    use rand::Rng;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::Instant;
    use tempfile::TempDir;

    struct TestServer {
        addr: SocketAddr,
        handle: ReactorHandle,
        registry: Arc<Registry>,
        thread: Option<JoinHandle<Result<(), ServerError>>>,
        _dir: TempDir,
    }

    impl TestServer {
        fn start() -> Self {
            let dir = TempDir::new().unwrap();
            let config = ServerConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                data_dir: dir.path().to_path_buf(),
                worker_threads: 4,
                poll_timeout: Duration::from_millis(50),
                ..ServerConfig::default()
            };
            let server = ChatServer::bind(&config).unwrap();
            let addr = server.local_addr();
            let handle = server.handle();
            let registry = server.registry();
            let thread = thread::spawn(move || server.run());
            Self {
                addr,
                handle,
                registry,
                thread: Some(thread),
                _dir: dir,
            }
        }

        fn client(&self) -> Client {
            Client::connect(self.addr)
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    struct Client {
        stream: TcpStream,
        decoder: Decoder,
        buf: BytesMut,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.set_nodelay(true).unwrap();
            Self {
                stream,
                decoder: Decoder::new(),
                buf: BytesMut::new(),
            }
        }

        fn send(&mut self, message: &Message) {
            self.stream.write_all(&message.to_bytes()).unwrap();
        }

        fn recv(&mut self) -> Message {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(message) = self.decoder.decode(&mut self.buf).unwrap() {
                    return message;
                }
                let n = self.stream.read(&mut chunk).unwrap();
                assert!(n > 0, "server closed the connection");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        fn call(&mut self, message: &Message) -> Message {
            self.send(message);
            self.recv()
        }

        fn sign_up(&mut self, user: &str) -> Message {
            self.call(
                &Message::request(StatusCode::SIGN_UP)
                    .with_header(headers::USER, user)
                    .with_header(headers::PASSWORD, "pw"),
            )
        }

        fn sign_in(&mut self, user: &str) -> Message {
            self.call(
                &Message::request(StatusCode::SIGN_IN)
                    .with_header(headers::USER, user)
                    .with_header(headers::PASSWORD, "pw"),
            )
        }

        fn online(&mut self, user: &str) {
            assert_eq!(self.sign_up(user).header(headers::RETURN), Some(RETURN_RIGHT));
            assert_eq!(self.sign_in(user).header(headers::RETURN), Some(RETURN_RIGHT));
        }
    }

    fn direct(sender: &str, peer: &str, body: &str) -> Message {
        Message::request(StatusCode::SEND_MESSAGE)
            .with_header(headers::USER, sender)
            .with_header(headers::PEER, peer)
            .with_header(headers::TIME, "2024-05-01 09:30:00")
            .with_body(body.to_string())
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_request_split_across_writes() {
        let server = TestServer::start();
        let mut client = server.client();

        let bytes = Message::request(StatusCode::SIGN_UP)
            .with_header(headers::USER, "alice")
            .with_header(headers::PASSWORD, "pw")
            .to_bytes();

        let mut rng = rand::thread_rng();
        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + rng.gen_range(1..8)).min(bytes.len());
            client.stream.write_all(&bytes[offset..end]).unwrap();
            client.stream.flush().unwrap();
            thread::sleep(Duration::from_millis(2));
            offset = end;
        }

        let response = client.recv();
        assert_eq!(response.status, StatusCode::SIGN_UP_RESULT);
        assert_eq!(response.header(headers::RETURN), Some(RETURN_RIGHT));
    }

    #[test]
    fn test_coalesced_requests_each_answered() {
        let server = TestServer::start();
        let mut client = server.client();

        let mut batch = BytesMut::new();
        for user in ["alice", "bob", "carol"] {
            batch.extend_from_slice(
                &Message::request(StatusCode::SIGN_UP)
                    .with_header(headers::USER, user)
                    .with_header(headers::PASSWORD, "pw")
                    .to_bytes(),
            );
        }
        // Plus the first half of a fourth request.
        let tail = Message::request(StatusCode::SIGN_UP)
            .with_header(headers::USER, "alice")
            .with_header(headers::PASSWORD, "pw")
            .to_bytes();
        batch.extend_from_slice(&tail[..10]);
        client.stream.write_all(&batch).unwrap();

        for _ in 0..3 {
            let response = client.recv();
            assert_eq!(response.status, StatusCode::SIGN_UP_RESULT);
            assert_eq!(response.header(headers::RETURN), Some(RETURN_RIGHT));
        }

        client.stream.write_all(&tail[10..]).unwrap();
        let dup = client.recv();
        assert_eq!(dup.header(headers::RETURN), Some(RETURN_WRONG));
        assert_eq!(dup.header(headers::WRONG), Some(reasons::DUP_USER));
    }

    #[test]
    fn test_account_errors() {
        let server = TestServer::start();
        let mut first = server.client();
        let mut second = server.client();

        assert_eq!(first.sign_in("ghost").status, StatusCode::NOT_FOUND);

        first.online("alice");
        assert_eq!(second.sign_up("alice").header(headers::WRONG), Some(reasons::DUP_USER));

        let wrong_pw = second.call(
            &Message::request(StatusCode::SIGN_IN)
                .with_header(headers::USER, "alice")
                .with_header(headers::PASSWORD, "bad"),
        );
        assert_eq!(wrong_pw.header(headers::WRONG), Some(reasons::WRONG_PASSWORD));

        let repeat = second.sign_in("alice");
        assert_eq!(repeat.header(headers::WRONG), Some(reasons::REPEAT_LOGIN));
    }

    #[test]
    fn test_malformed_request_keeps_connection() {
        let server = TestServer::start();
        let mut client = server.client();

        client
            .stream
            .write_all(b"REQ 010 JCHAT/1.0\r\nUser alice\r\n\r\n")
            .unwrap();
        assert_eq!(client.recv().status, StatusCode::MALFORMED);

        client.stream.write_all(b"HELLO\r\n\r\n").unwrap();
        assert_eq!(client.recv().status, StatusCode::MALFORMED);

        assert_eq!(client.sign_up("alice").status, StatusCode::SIGN_UP_RESULT);
    }

    #[test]
    fn test_malformed_request_body_does_not_swallow_next() {
        let server = TestServer::start();
        let mut client = server.client();

        let mut wire =
            b"REQ 110 JCHAT/1.0\r\nContent-Length: 5\r\nbroken-line\r\n\r\nhello".to_vec();
        wire.extend_from_slice(
            &Message::request(StatusCode::SIGN_UP)
                .with_header(headers::USER, "alice")
                .with_header(headers::PASSWORD, "pw")
                .to_bytes(),
        );
        client.stream.write_all(&wire).unwrap();

        assert_eq!(client.recv().status, StatusCode::MALFORMED);
        let signed_up = client.recv();
        assert_eq!(signed_up.status, StatusCode::SIGN_UP_RESULT);
        assert_eq!(signed_up.header(headers::RETURN), Some(RETURN_RIGHT));

        // No stray 401 is left queued ahead of the next answer.
        assert_eq!(client.sign_up("bob").status, StatusCode::SIGN_UP_RESULT);
    }

    #[test]
    fn test_offline_message_delivered_at_sign_in() {
        let server = TestServer::start();
        let mut alice = server.client();
        alice.online("alice");
        let mut bob = server.client();
        bob.sign_up("bob");

        let response = alice.call(&direct("alice", "bob", "see you at noon"));
        assert_eq!(response.header(headers::RETURN), Some(RETURN_RIGHT));
        assert_eq!(server.registry.pending_offline("bob").get("alice"), Some(&1));

        let signed_in = bob.sign_in("bob");
        assert_eq!(signed_in.header(headers::OFFLINE), Some("1"));
        assert_eq!(
            &signed_in.body[..],
            &b"time: 2024-05-01 09:30:00\r\nsender: alice\r\nreceiver: bob\r\nlen: 15\r\nsee you at noon\r\n"[..]
        );
        assert!(server.registry.pending_offline("bob").is_empty());
    }

    #[test]
    fn test_online_message_is_single_notification() {
        let server = TestServer::start();
        let mut alice = server.client();
        alice.online("alice");
        let mut bob = server.client();
        bob.online("bob");

        let response = alice.call(&direct("alice", "bob", "ping"));
        assert_eq!(response.status, StatusCode::SEND_MESSAGE_RESULT);

        let notice = bob.recv();
        assert_eq!(notice.method, Method::Inf);
        assert_eq!(notice.status, StatusCode::MESSAGE_NOTICE);
        assert_eq!(notice.header(headers::SENDER), Some("alice"));
        assert_eq!(&notice.body[..], b"ping");
        assert!(server.registry.pending_offline("bob").is_empty());

        // Nothing else is waiting for bob.
        bob.stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(bob.stream.read(&mut probe).is_err());
    }

    #[test]
    fn test_group_creation_reaches_online_and_offline_members() {
        let server = TestServer::start();
        let mut alice = server.client();
        alice.online("alice");
        let mut bob = server.client();
        bob.online("bob");
        let mut carol = server.client();
        carol.sign_up("carol");
        let mut dave = server.client();
        dave.sign_up("dave");

        let response = alice.call(
            &Message::request(StatusCode::CREATE_GROUP)
                .with_header(headers::USER, "alice")
                .with_header(headers::OTHERS, "bob carol dave")
                .with_header(headers::GROUP, "team"),
        );
        assert_eq!(response.header(headers::RETURN), Some(RETURN_RIGHT));

        let notice = bob.recv();
        assert_eq!(notice.status, StatusCode::GROUP_CREATED_NOTICE);
        assert_eq!(notice.header(headers::OTHERS), Some("alice bob carol dave"));

        for (client, user) in [(&mut carol, "carol"), (&mut dave, "dave")] {
            let signed_in = client.sign_in(user);
            assert_eq!(
                signed_in.header(headers::GROUP),
                Some("team$alice$bob$carol$dave")
            );
        }

        let members = server.registry.group_members("team").unwrap();
        let expected: Vec<&str> = vec!["alice", "bob", "carol", "dave"];
        assert_eq!(members.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_concurrent_notifications_stay_framed() {
        const SENDERS: usize = 4;
        const PER_SENDER: usize = 25;

        let server = TestServer::start();
        let mut bob = server.client();
        bob.online("bob");

        let senders: Vec<_> = (0..SENDERS)
            .map(|n| {
                let mut client = server.client();
                let user = format!("user{n}");
                client.online(&user);
                thread::spawn(move || {
                    for i in 0..PER_SENDER {
                        let body = format!("{user} message {i} {}", "x".repeat(i * 97));
                        let response = client.call(&direct(&user, "bob", &body));
                        assert_eq!(response.header(headers::RETURN), Some(RETURN_RIGHT));
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        for _ in 0..SENDERS * PER_SENDER {
            received.push(bob.recv());
        }
        for sender in senders {
            sender.join().unwrap();
        }

        assert_eq!(received.len(), SENDERS * PER_SENDER);
        for notice in &received {
            assert_eq!(notice.status, StatusCode::MESSAGE_NOTICE);
            let sender = notice.header(headers::SENDER).unwrap();
            let body = std::str::from_utf8(&notice.body).unwrap();
            assert!(body.starts_with(sender), "body {body:?} from {sender}");
        }
        for n in 0..SENDERS {
            let user = format!("user{n}");
            let count = received
                .iter()
                .filter(|m| m.header(headers::SENDER) == Some(user.as_str()))
                .count();
            assert_eq!(count, PER_SENDER);
        }
    }

    #[test]
    fn test_disconnect_frees_session() {
        let server = TestServer::start();
        let mut alice = server.client();
        alice.online("alice");
        drop(alice);

        assert!(wait_until(|| server.registry.session_of("alice").is_none()));
        let mut again = server.client();
        assert_eq!(again.sign_in("alice").header(headers::RETURN), Some(RETURN_RIGHT));
    }

    #[test]
    fn test_file_upload_and_download() {
        let server = TestServer::start();
        let mut alice = server.client();
        alice.online("alice");
        let mut bob = server.client();
        bob.online("bob");

        let upload = Message::request(StatusCode::UPLOAD_FILE)
            .with_header(headers::USER, "alice")
            .with_header(headers::PEER, "bob")
            .with_header(headers::TIME, "t")
            .with_header(headers::FILE_NAME, "data.bin")
            .with_body(vec![7u8; 100_000]);
        assert_eq!(alice.call(&upload).header(headers::RETURN), Some(RETURN_RIGHT));

        let notice = bob.recv();
        assert_eq!(notice.status, StatusCode::FILE_NOTICE);
        assert_eq!(notice.header(headers::FILE_SIZE), Some("100000"));

        let file = bob.call(
            &Message::request(StatusCode::DOWNLOAD_FILE)
                .with_header(headers::USER, "bob")
                .with_header(headers::SENDER, "alice")
                .with_header(headers::FILE_NAME, "data.bin"),
        );
        assert_eq!(file.header(headers::RETURN), Some(RETURN_RIGHT));
        assert_eq!(file.body.len(), 100_000);
        assert!(file.body.iter().all(|&b| b == 7));
    }
}
