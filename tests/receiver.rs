//! End-to-end tests: raw SMTP dialogues against a server bound to an
//! ephemeral port, verifying the persisted artifacts on disk.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    task::JoinHandle,
};

use mailsink::{config::Config, mail::MailRecord, server::Server};

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    storage: PathBuf,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    /// Start a server on an ephemeral port. `smtp_extra` is appended to the
    /// `[smtp]` section of the generated configuration.
    async fn start(max_size: u64, max_recipients: usize, smtp_extra: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("mail");

        let config_text = format!(
            r#"
[server]
host = "127.0.0.1"
port = 2525
instance_name = "itest"

[smtp]
hostname = "mx.test.example"
max_size = {max_size}
max_recipients = {max_recipients}
{smtp_extra}

[storage]
path = "{storage}"
"#,
            storage = storage.display(),
        );

        let config_path = dir.path().join("mailsink.config.toml");
        std::fs::write(&config_path, config_text).unwrap();

        let config = Config::load(&config_path).unwrap();
        let server = Arc::new(Server::new(config, None).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server.serve(listener).await.unwrap();
            }
        });

        Self {
            server,
            addr,
            storage,
            handle,
            _dir: dir,
        }
    }

    fn with_credentials(dir: &tempfile::TempDir, entries: &str) -> String {
        let auth_file = dir.path().join("users");
        std::fs::write(&auth_file, entries).unwrap();
        format!("auth_file = \"{}\"", auth_file.display())
    }

    /// Messages persisted so far, excluding the scratch area.
    fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.storage)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "eml"))
            .collect();
        paths.sort();
        paths
    }

    async fn shutdown(self) {
        self.server.trigger_shutdown();
        self.handle.await.unwrap();
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and consume the greeting.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };

        let greeting = client.read_reply().await;
        assert!(greeting.starts_with("220 "), "unexpected greeting: {greeting}");

        client
    }

    async fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_reply().await
    }

    /// Send a command and collect a (possibly multi-line) reply.
    async fn cmd_multi(&mut self, line: &str) -> Vec<String> {
        self.send(line).await;

        let mut replies = Vec::new();
        loop {
            let reply = self.read_reply().await;
            let done = reply.len() < 4 || reply.as_bytes()[3] != b'-';
            replies.push(reply);

            if done {
                break;
            }
        }

        replies
    }

    async fn auth_plain(&mut self, username: &str, secret: &str) -> String {
        let initial = BASE64.encode(format!("\0{username}\0{secret}"));
        self.cmd(&format!("AUTH PLAIN {initial}")).await
    }

    /// Run MAIL/RCPT/DATA and return the reply to the final dot.
    async fn submit(&mut self, from: &str, recipients: &[&str], body_lines: &[&str]) -> String {
        let reply = self.cmd(&format!("MAIL FROM:<{from}>")).await;
        assert!(reply.starts_with("250 "), "MAIL rejected: {reply}");

        for recipient in recipients {
            let reply = self.cmd(&format!("RCPT TO:<{recipient}>")).await;
            assert!(reply.starts_with("250 "), "RCPT rejected: {reply}");
        }

        let reply = self.cmd("DATA").await;
        assert!(reply.starts_with("354 "), "DATA rejected: {reply}");

        for line in body_lines {
            self.send(line).await;
        }

        self.cmd(".").await
    }

    async fn quit(mut self) {
        let reply = self.cmd("QUIT").await;
        assert!(reply.starts_with("221 "));
    }
}

fn accepted_id(reply: &str) -> String {
    let id = reply
        .strip_prefix("250 Ok: message ")
        .and_then(|rest| rest.strip_suffix(" accepted for delivery"))
        .unwrap_or_else(|| panic!("unexpected DATA reply: {reply}"));

    id.to_string()
}

fn embedded_record(content: &str) -> MailRecord {
    let first_line = content.lines().next().unwrap();
    let json = first_line.strip_prefix("X-Mailsink-Record: ").unwrap();

    serde_json::from_str(json).unwrap()
}

#[tokio::test]
async fn authenticated_submission_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = TestServer::with_credentials(&dir, "alice:secret1\n");
    let server = TestServer::start(10240, 10, &credentials).await;

    let mut client = Client::connect(server.addr).await;

    let ehlo = client.cmd_multi("EHLO client.example.com").await;
    assert!(ehlo.iter().any(|line| line.contains("AUTH PLAIN LOGIN")));
    assert!(ehlo.iter().any(|line| line.contains("SIZE 10240")));

    let reply = client.auth_plain("alice", "secret1").await;
    assert!(reply.starts_with("235 "), "AUTH rejected: {reply}");

    let reply = client
        .submit("alice@example.com", &["bob@example.org"], &["hello"])
        .await;
    let id = accepted_id(&reply);
    assert!(!id.is_empty());

    client.quit().await;

    let artifacts = server.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(
        artifacts[0].file_stem().unwrap().to_str().unwrap(),
        id,
        "artifact filename derives from the returned identifier"
    );

    let content = std::fs::read_to_string(&artifacts[0]).unwrap();
    assert!(content.contains(&format!("Message-ID: <{id}@mx.test.example>")));
    assert!(content.ends_with("hello\r\n"));

    let record = embedded_record(&content);
    assert_eq!(record.id, id);
    assert_eq!(record.username, "alice");
    assert_eq!(record.mail_from, "alice@example.com");
    assert_eq!(record.rcpt_to, vec!["bob@example.org".to_string()]);
    assert_eq!(record.size, "hello\r\n".len() as u64);

    server.shutdown().await;
}

#[tokio::test]
async fn anonymous_submission_disabled_rejects_sender() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = TestServer::with_credentials(&dir, "alice:secret1\n");
    let server = TestServer::start(10240, 10, &credentials).await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    let reply = client.cmd("MAIL FROM:<alice@example.com>").await;
    assert!(reply.starts_with("530 "), "expected auth rejection: {reply}");

    // The envelope never started, so RCPT is still out of sequence
    let reply = client.cmd("RCPT TO:<bob@example.org>").await;
    assert!(reply.starts_with("503 "));

    client.quit().await;

    assert!(server.artifacts().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn wrong_credentials_can_retry() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = TestServer::with_credentials(&dir, "alice:secret1\n");
    let server = TestServer::start(10240, 10, &credentials).await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    let reply = client.auth_plain("alice", "wrong").await;
    assert!(reply.starts_with("535 "));

    let reply = client.auth_plain("mallory", "secret1").await;
    assert!(reply.starts_with("535 "));

    let reply = client.auth_plain("alice", "secret1").await;
    assert!(reply.starts_with("235 "));

    client.quit().await;
    server.shutdown().await;
}

#[tokio::test]
async fn auth_login_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = TestServer::with_credentials(&dir, "alice:secret1\n");
    let server = TestServer::start(10240, 10, &credentials).await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    let reply = client.cmd("AUTH LOGIN").await;
    assert_eq!(reply, "334 VXNlcm5hbWU6");

    let reply = client.cmd(&BASE64.encode("alice")).await;
    assert_eq!(reply, "334 UGFzc3dvcmQ6");

    let reply = client.cmd(&BASE64.encode("secret1")).await;
    assert!(reply.starts_with("235 "));

    client.quit().await;
    server.shutdown().await;
}

#[tokio::test]
async fn recipient_limit_enforced_per_envelope() {
    let server = TestServer::start(10240, 2, "allow_anonymous = true").await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    let reply = client.cmd("MAIL FROM:<alice@example.com>").await;
    assert!(reply.starts_with("250 "));

    assert!(client.cmd("RCPT TO:<one@example.org>").await.starts_with("250 "));
    assert!(client.cmd("RCPT TO:<two@example.org>").await.starts_with("250 "));

    let reply = client.cmd("RCPT TO:<three@example.org>").await;
    assert!(reply.starts_with("452 "), "expected recipient limit: {reply}");

    // The first two recipients survive and the message goes through
    let reply = client.cmd("DATA").await;
    assert!(reply.starts_with("354 "));
    client.send("body").await;
    let reply = client.cmd(".").await;
    let id = accepted_id(&reply);

    client.quit().await;

    let content =
        std::fs::read_to_string(server.storage.join(format!("{id}.eml"))).unwrap();
    let record = embedded_record(&content);
    assert_eq!(
        record.rcpt_to,
        vec!["one@example.org".to_string(), "two@example.org".to_string()]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn second_mail_discards_previous_recipients() {
    let server = TestServer::start(10240, 10, "allow_anonymous = true").await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    client.cmd("MAIL FROM:<alice@example.com>").await;
    client.cmd("RCPT TO:<stale@example.org>").await;

    client.cmd("MAIL FROM:<alice@example.com>").await;
    client.cmd("RCPT TO:<fresh@example.org>").await;

    client.cmd("DATA").await;
    client.send("body").await;
    let reply = client.cmd(".").await;
    let id = accepted_id(&reply);

    client.quit().await;

    let content =
        std::fs::read_to_string(server.storage.join(format!("{id}.eml"))).unwrap();
    let record = embedded_record(&content);
    assert_eq!(record.rcpt_to, vec!["fresh@example.org".to_string()]);

    server.shutdown().await;
}

#[tokio::test]
async fn declared_size_over_limit_rejected() {
    let server = TestServer::start(1024, 10, "allow_anonymous = true").await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    let reply = client
        .cmd("MAIL FROM:<alice@example.com> SIZE=4096")
        .await;
    assert!(reply.starts_with("552 "), "expected size rejection: {reply}");

    client.quit().await;
    server.shutdown().await;
}

#[tokio::test]
async fn oversized_body_rejected() {
    let server = TestServer::start(64, 10, "allow_anonymous = true").await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    client.cmd("MAIL FROM:<alice@example.com>").await;
    client.cmd("RCPT TO:<bob@example.org>").await;
    client.cmd("DATA").await;

    for _ in 0..8 {
        client.send("a line that will push the body over the cap").await;
    }
    let reply = client.cmd(".").await;
    assert!(reply.starts_with("552 "), "expected size rejection: {reply}");

    client.quit().await;

    assert!(server.artifacts().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_submissions_never_collide() {
    let server = TestServer::start(10240, 10, "allow_anonymous = true").await;

    let mut tasks = Vec::new();
    for n in 0..4 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.cmd_multi("EHLO client.example.com").await;

            let reply = client
                .submit(
                    &format!("sender{n}@example.com"),
                    &["bob@example.org"],
                    &[&format!("message number {n}")],
                )
                .await;

            let id = accepted_id(&reply);
            client.quit().await;
            id
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4, "identifiers must be unique");
    assert_eq!(server.artifacts().len(), 4);

    server.shutdown().await;
}

#[tokio::test]
async fn body_is_stored_verbatim_with_dot_unstuffing() {
    let server = TestServer::start(10240, 10, "allow_anonymous = true").await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    let reply = client
        .submit(
            "alice@example.com",
            &["bob@example.org"],
            &["Subject: dots", "", "..starts with a dot", "plain line"],
        )
        .await;
    let id = accepted_id(&reply);
    client.quit().await;

    let content =
        std::fs::read_to_string(server.storage.join(format!("{id}.eml"))).unwrap();
    assert!(content
        .ends_with("Subject: dots\r\n\r\n.starts with a dot\r\nplain line\r\n"));

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() {
    let server = TestServer::start(10240, 10, "allow_anonymous = true").await;

    let mut client = Client::connect(server.addr).await;
    client.cmd_multi("EHLO client.example.com").await;

    server.server.trigger_shutdown();

    let reply = client.read_reply().await;
    assert!(reply.starts_with("421 "), "expected shutdown notice: {reply}");

    server.handle.await.unwrap();
}
