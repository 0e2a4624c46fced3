use core::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

use async_trait::async_trait;

use super::{connection::TlsInfo, status::Status};

/// A command rejection: the reply code and text the engine should send while
/// keeping the connection open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub status: Status,
    pub message: String,
}

impl Reject {
    pub fn new<S: Into<String>>(status: Status, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl Display for Reject {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.status, self.message)
    }
}

pub type HandlerResult<T = ()> = Result<T, Reject>;

/// The fixed set of callbacks the protocol engine drives. The engine never
/// depends on a concrete session type, only on this interface.
#[async_trait]
pub trait Handler: Send {
    /// Verify credentials. On success the session is authenticated for the
    /// rest of the connection.
    async fn authenticate(&mut self, username: &str, secret: &str) -> HandlerResult;

    /// Start a new envelope. Any previously accepted recipients are
    /// discarded.
    async fn mail_from(&mut self, sender: &str, declared_size: Option<u64>) -> HandlerResult;

    /// Add one recipient to the current envelope.
    async fn rcpt_to(&mut self, recipient: &str) -> HandlerResult;

    /// Submit the collected message body. Returns the identifier assigned to
    /// the accepted message. The envelope is finished either way.
    async fn data(&mut self, body: &[u8]) -> HandlerResult<String>;

    /// Drop the current envelope, keeping authentication state.
    async fn reset(&mut self);

    /// The connection is going away.
    async fn logout(&mut self);

    /// Transport security was negotiated on the connection.
    fn tls_established(&mut self, info: &TlsInfo);
}

/// Creates one handler per accepted connection.
pub trait Backend: Send + Sync + 'static {
    type Session: Handler + 'static;

    fn new_session(&self, peer: SocketAddr) -> Self::Session;
}
