use std::{net::SocketAddr, path::PathBuf, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use mailparse::{MailAddr, MailAddrList};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};

use crate::{incoming, internal, outgoing, Signal};

use super::{
    command::{Command, HeloVariant},
    connection::{Connection, ConnectionError},
    handler::{Handler, Reject},
    status::Status,
    Extension, State,
};

const COMMAND_LINE_LIMIT: usize = 1024;
const DATA_LINE_LIMIT: usize = 8192;

/// Rejections tolerated before the connection is dropped.
const MAX_ERRORS: usize = 10;

#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    #[error("session timed out after {0} seconds")]
    Timeout(u64),
}

#[derive(Clone, Debug)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub command_secs: u64,
    pub data_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: 300,
            data_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Hostname used in the greeting and EHLO response.
    pub banner: String,
    pub extensions: Vec<Extension>,
    pub tls_context: Option<TlsContext>,
    /// Permit AUTH on a plaintext connection even though TLS is configured.
    pub allow_insecure_auth: bool,
    /// Transport-level cap while reading DATA. The authoritative policy
    /// check lives behind the handler; this only bounds buffering. Zero
    /// disables the cap.
    pub max_message_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mechanism {
    Plain,
    Login,
}

impl TryFrom<&str> for Mechanism {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PLAIN" => Ok(Self::Plain),
            "LOGIN" => Ok(Self::Login),
            _ => Err(()),
        }
    }
}

/// An AUTH exchange in flight; raw lines are challenge responses until it
/// completes or is cancelled.
struct AuthExchange {
    mechanism: Mechanism,
    username: Option<String>,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync, H: Handler> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    config: SessionConfig,
    timeouts: Timeouts,
    handler: H,
    state: State,
    auth: Option<AuthExchange>,
    authenticated: bool,
    body: Vec<u8>,
    body_overflow: bool,
    errors: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync, H: Handler> Session<Stream, H> {
    pub fn create(stream: Stream, peer: SocketAddr, config: SessionConfig, handler: H) -> Self {
        Self {
            peer,
            connection: Connection::plain(stream),
            config: SessionConfig {
                banner: if config.banner.is_empty() {
                    "localhost".to_string()
                } else {
                    config.banner
                },
                ..config
            },
            timeouts: Timeouts::default(),
            handler,
            state: State::default(),
            auth: None,
            authenticated: false,
            body: Vec::new(),
            body_overflow: false,
            errors: 0,
        }
    }

    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected to {}", self.peer);

        let greeting = format!("{} {} ESMTP service ready", Status::ServiceReady, self.config.banner);
        self.send(&greeting).await?;

        loop {
            let reading = self.state == State::Reading;
            let limit = if reading { DATA_LINE_LIMIT } else { COMMAND_LINE_LIMIT };
            let timeout = Duration::from_secs(if reading {
                self.timeouts.data_secs
            } else {
                self.timeouts.command_secs
            });

            let line = tokio::select! {
                sig = signal.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                            let farewell =
                                format!("{} Service shutting down", Status::Unavailable);
                            let _ = self.send(&farewell).await;
                            self.handler.logout().await;
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }

                result = tokio::time::timeout(timeout, self.connection.read_line(limit)) => {
                    match result {
                        Err(_) => {
                            tracing::warn!(
                                peer = %self.peer,
                                state = %self.state,
                                "Client connection timed out"
                            );
                            let farewell =
                                format!("{} Connection timed out", Status::Unavailable);
                            let _ = self.send(&farewell).await;
                            self.handler.logout().await;
                            return Err(SessionError::Timeout(timeout.as_secs()));
                        }
                        Ok(Err(ConnectionError::LineTooLong(limit))) => {
                            let complaint = format!("{} Line too long", Status::SyntaxError);
                            let _ = self.send(&complaint).await;
                            self.handler.logout().await;
                            return Err(ConnectionError::LineTooLong(limit).into());
                        }
                        Ok(Err(err)) => {
                            internal!(level = ERROR, "{err}");
                            self.handler.logout().await;
                            return Err(err.into());
                        }
                        Ok(Ok(None)) => {
                            internal!("Connection closed by peer");
                            self.handler.logout().await;
                            return Ok(());
                        }
                        Ok(Ok(Some(line))) => line,
                    }
                }
            };

            let (replies, event) = self.handle_line(line).await;

            for reply in &replies {
                self.send(reply).await?;
            }

            if event == Event::ConnectionClose {
                internal!("Connection closed");
                self.handler.logout().await;
                return Ok(());
            }

            // The TLS upgrade is handled inline to avoid borrowing issues
            if self.state == State::StartTls {
                let Some(tls_context) = self.config.tls_context.clone() else {
                    self.state = State::Greeted;
                    continue;
                };

                match self.connection.upgrade(&tls_context).await {
                    Ok((connection, info)) => {
                        self.connection = connection;
                        tracing::debug!("Connection successfully upgraded with {info:#?}");

                        self.handler.tls_established(&info);
                        // RFC 3207: the protocol resets, the client greets again
                        self.handler.reset().await;
                        self.state = State::Connect;
                    }
                    Err(err) => {
                        internal!(level = ERROR, "STARTTLS failed: {err}");
                        self.handler.logout().await;
                        return Err(err.into());
                    }
                }
            }
        }
    }

    async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        reply: &S,
    ) -> Result<(), ConnectionError> {
        outgoing!("{reply}");
        self.connection.send(reply).await
    }

    async fn handle_line(&mut self, line: Vec<u8>) -> (Vec<String>, Event) {
        if self.state == State::Reading {
            return self.feed_data(line).await;
        }

        if self.auth.is_some() {
            return self.feed_auth(line).await;
        }

        let command = Command::try_from(&line[..]).map_or_else(|err| err, |command| command);
        incoming!("{command}");

        self.apply(command).await
    }

    fn reply(status: Status, text: &str) -> Vec<String> {
        vec![format!("{status} {text}")]
    }

    fn rejected(&mut self, reject: Reject) -> (Vec<String>, Event) {
        self.errors += 1;

        if self.errors >= MAX_ERRORS {
            (
                Self::reply(Status::Unavailable, "Too many errors"),
                Event::ConnectionClose,
            )
        } else {
            (vec![reject.to_string()], Event::ConnectionKeepAlive)
        }
    }

    fn bad_sequence(&mut self) -> (Vec<String>, Event) {
        self.rejected(Reject::new(
            Status::InvalidCommandSequence,
            "Bad sequence of commands",
        ))
    }

    async fn apply(&mut self, command: Command) -> (Vec<String>, Event) {
        match command {
            Command::Noop => (Self::reply(Status::Ok, "Ok"), Event::ConnectionKeepAlive),

            Command::Quit => {
                self.state = State::Quit;
                (Self::reply(Status::GoodBye, "Bye"), Event::ConnectionClose)
            }

            Command::Rset => {
                self.handler.reset().await;
                if self.state != State::Connect {
                    self.state = State::Greeted;
                }
                (Self::reply(Status::Ok, "Ok"), Event::ConnectionKeepAlive)
            }

            Command::Helo(variant) => self.greet(variant).await,

            Command::StartTls => {
                if self.config.tls_context.is_none() || self.connection.is_encrypted() {
                    self.rejected(Reject::new(Status::NotImplemented, "TLS not available"))
                } else if self.state == State::Greeted {
                    self.state = State::StartTls;
                    (
                        Self::reply(Status::ServiceReady, "Ready to begin TLS"),
                        Event::ConnectionKeepAlive,
                    )
                } else {
                    self.bad_sequence()
                }
            }

            Command::Auth { mechanism, initial } => self.begin_auth(&mechanism, initial).await,

            Command::MailFrom { sender, size } => match self.state {
                State::Greeted | State::MailFrom | State::RcptTo => {
                    let sender = match sender {
                        None => String::default(),
                        Some(MailAddr::Single(single)) => single.addr,
                        Some(MailAddr::Group(_)) => {
                            return self.rejected(Reject::new(
                                Status::ParameterError,
                                "Invalid sender address",
                            ));
                        }
                    };

                    match self.handler.mail_from(&sender, size).await {
                        Ok(()) => {
                            self.state = State::MailFrom;
                            (Self::reply(Status::Ok, "Ok"), Event::ConnectionKeepAlive)
                        }
                        Err(reject) => self.rejected(reject),
                    }
                }
                _ => self.bad_sequence(),
            },

            Command::RcptTo(list) => match self.state {
                State::MailFrom | State::RcptTo => {
                    for recipient in Self::recipient_addresses(&list) {
                        if let Err(reject) = self.handler.rcpt_to(&recipient).await {
                            return self.rejected(reject);
                        }

                        self.state = State::RcptTo;
                    }

                    (Self::reply(Status::Ok, "Ok"), Event::ConnectionKeepAlive)
                }
                _ => self.bad_sequence(),
            },

            Command::Data => {
                if self.state == State::RcptTo {
                    self.state = State::Reading;
                    self.body.clear();
                    self.body_overflow = false;
                    (
                        Self::reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>"),
                        Event::ConnectionKeepAlive,
                    )
                } else {
                    self.bad_sequence()
                }
            }

            Command::Invalid(_) => {
                self.rejected(Reject::new(Status::SyntaxError, "Command not recognized"))
            }
        }
    }

    fn recipient_addresses(list: &MailAddrList) -> Vec<String> {
        list.iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.addr.clone()],
                MailAddr::Group(group) => {
                    group.addrs.iter().map(|single| single.addr.clone()).collect()
                }
            })
            .collect()
    }

    async fn greet(&mut self, variant: HeloVariant) -> (Vec<String>, Event) {
        // Greeting anew abandons any envelope in progress
        self.handler.reset().await;
        self.state = State::Greeted;

        match variant {
            HeloVariant::Helo(id) => (
                Self::reply(Status::Ok, &format!("Hello {id}")),
                Event::ConnectionKeepAlive,
            ),
            HeloVariant::Ehlo(id) => {
                let extensions = &self.config.extensions;
                let response = vec![format!(
                    "{}{}{} Hello {}",
                    Status::Ok,
                    if extensions.is_empty() { ' ' } else { '-' },
                    self.config.banner,
                    id
                )];

                (
                    extensions
                        .iter()
                        .enumerate()
                        .fold(response, |mut response, (idx, extension)| {
                            response.push(format!(
                                "{}{}{}",
                                Status::Ok,
                                if idx == extensions.len() - 1 { ' ' } else { '-' },
                                extension
                            ));

                            response
                        }),
                    Event::ConnectionKeepAlive,
                )
            }
        }
    }

    async fn begin_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> (Vec<String>, Event) {
        if self.state != State::Greeted {
            return self.bad_sequence();
        }

        if self.authenticated {
            return self.rejected(Reject::new(
                Status::InvalidCommandSequence,
                "Already authenticated",
            ));
        }

        if self.config.tls_context.is_some()
            && !self.connection.is_encrypted()
            && !self.config.allow_insecure_auth
        {
            return self.rejected(Reject::new(
                Status::EncryptionRequired,
                "Must issue a STARTTLS command first",
            ));
        }

        let Ok(mechanism) = Mechanism::try_from(mechanism) else {
            return self.rejected(Reject::new(
                Status::MechanismUnsupported,
                "Unsupported authentication mechanism",
            ));
        };

        match (mechanism, initial) {
            (Mechanism::Plain, Some(initial)) => self.finish_plain(&initial).await,
            (Mechanism::Plain, None) => {
                self.auth = Some(AuthExchange {
                    mechanism,
                    username: None,
                });
                (
                    vec![format!("{} ", Status::ServerChallenge)],
                    Event::ConnectionKeepAlive,
                )
            }
            (Mechanism::Login, Some(initial)) => match Self::decode_utf8(&initial) {
                Ok(username) => {
                    self.auth = Some(AuthExchange {
                        mechanism,
                        username: Some(username),
                    });
                    (
                        vec![format!("{} UGFzc3dvcmQ6", Status::ServerChallenge)],
                        Event::ConnectionKeepAlive,
                    )
                }
                Err(()) => self.rejected(Reject::new(
                    Status::ParameterError,
                    "Invalid base64 encoding",
                )),
            },
            (Mechanism::Login, None) => {
                self.auth = Some(AuthExchange {
                    mechanism,
                    username: None,
                });
                (
                    vec![format!("{} VXNlcm5hbWU6", Status::ServerChallenge)],
                    Event::ConnectionKeepAlive,
                )
            }
        }
    }

    async fn feed_auth(&mut self, line: Vec<u8>) -> (Vec<String>, Event) {
        // Challenge responses carry credentials, so they are never echoed
        incoming!("<auth exchange>");

        let Some(exchange) = self.auth.take() else {
            return self.bad_sequence();
        };

        let Ok(text) = std::str::from_utf8(&line) else {
            return self.rejected(Reject::new(
                Status::ParameterError,
                "Invalid base64 encoding",
            ));
        };
        let text = text.trim();

        if text == "*" {
            return self.rejected(Reject::new(
                Status::ParameterError,
                "Authentication cancelled",
            ));
        }

        match exchange.mechanism {
            Mechanism::Plain => self.finish_plain(text).await,
            Mechanism::Login => match exchange.username {
                None => match Self::decode_utf8(text) {
                    Ok(username) => {
                        self.auth = Some(AuthExchange {
                            mechanism: Mechanism::Login,
                            username: Some(username),
                        });
                        (
                            vec![format!("{} UGFzc3dvcmQ6", Status::ServerChallenge)],
                            Event::ConnectionKeepAlive,
                        )
                    }
                    Err(()) => self.rejected(Reject::new(
                        Status::ParameterError,
                        "Invalid base64 encoding",
                    )),
                },
                Some(username) => match Self::decode_utf8(text) {
                    Ok(secret) => self.finish_auth(&username, &secret).await,
                    Err(()) => self.rejected(Reject::new(
                        Status::ParameterError,
                        "Invalid base64 encoding",
                    )),
                },
            },
        }
    }

    fn decode_utf8(text: &str) -> Result<String, ()> {
        BASE64
            .decode(text.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(())
    }

    /// Decode the single PLAIN response: `authzid NUL authcid NUL passwd`.
    async fn finish_plain(&mut self, response: &str) -> (Vec<String>, Event) {
        let Ok(bytes) = BASE64.decode(response.trim().as_bytes()) else {
            return self.rejected(Reject::new(
                Status::ParameterError,
                "Invalid base64 encoding",
            ));
        };

        let parts: Vec<&[u8]> = bytes.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            return self.rejected(Reject::new(
                Status::ParameterError,
                "Invalid AUTH PLAIN response",
            ));
        }

        match (std::str::from_utf8(parts[1]), std::str::from_utf8(parts[2])) {
            (Ok(username), Ok(secret)) => {
                let (username, secret) = (username.to_string(), secret.to_string());
                self.finish_auth(&username, &secret).await
            }
            _ => self.rejected(Reject::new(
                Status::ParameterError,
                "Invalid AUTH PLAIN response",
            )),
        }
    }

    async fn finish_auth(&mut self, username: &str, secret: &str) -> (Vec<String>, Event) {
        match self.handler.authenticate(username, secret).await {
            Ok(()) => {
                self.authenticated = true;
                (
                    Self::reply(Status::AuthSucceeded, "Authentication succeeded"),
                    Event::ConnectionKeepAlive,
                )
            }
            Err(reject) => self.rejected(reject),
        }
    }

    async fn feed_data(&mut self, line: Vec<u8>) -> (Vec<String>, Event) {
        if line == b"." {
            self.state = State::Greeted;

            if self.body_overflow {
                self.body.clear();
                self.handler.reset().await;
                return self.rejected(Reject::new(
                    Status::ExceededStorage,
                    format!(
                        "Message exceeds maximum size of {}",
                        self.config.max_message_size
                    ),
                ));
            }

            let body = std::mem::take(&mut self.body);
            return match self.handler.data(&body).await {
                Ok(id) => (
                    Self::reply(Status::Ok, &format!("Ok: message {id} accepted for delivery")),
                    Event::ConnectionKeepAlive,
                ),
                Err(reject) => self.rejected(reject),
            };
        }

        // RFC 5321 4.5.2: strip one leading dot from dot-stuffed lines
        let content = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            &line[..]
        };

        if self.config.max_message_size > 0
            && (self.body.len() + content.len() + 2) as u64 > self.config.max_message_size
        {
            self.body_overflow = true;
            self.body.clear();
        }

        if !self.body_overflow {
            self.body.extend_from_slice(content);
            self.body.extend_from_slice(b"\r\n");
        }

        (Vec::new(), Event::ConnectionKeepAlive)
    }
}
