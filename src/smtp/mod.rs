pub mod command;
pub mod connection;
pub mod extensions;
pub mod handler;
pub mod session;
pub mod status;

use core::fmt::{self, Display, Formatter};

pub use command::Command;
pub use extensions::Extension;
pub use handler::{Backend, Handler, HandlerResult, Reject};
pub use session::{Session, SessionConfig, TlsContext};
pub use status::Status;

/// The protocol phase a session is in. The envelope itself (sender,
/// recipients, authentication) lives behind the [`Handler`]; this only
/// sequences the dialogue.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Default)]
pub enum State {
    #[default]
    Connect,
    Greeted,
    MailFrom,
    RcptTo,
    StartTls,
    Reading,
    Quit,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connect => "Connect",
            Self::Greeted => "Greeted",
            Self::MailFrom => "MAIL",
            Self::RcptTo => "RCPT",
            Self::StartTls => "STARTTLS",
            Self::Reading => "Reading",
            Self::Quit => "QUIT",
        })
    }
}
