use core::fmt::{self, Display, Formatter};

use mailparse::{MailAddr, MailAddrList};

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Ehlo(id) | Self::Helo(id) => id,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    /// If the sender is `None`, then it should be assumed this is the `null sender`,
    /// or `null reverse-path`, from [RFC-5321](https://www.ietf.org/rfc/rfc5321.txt).
    MailFrom {
        sender: Option<MailAddr>,
        size: Option<u64>,
    },
    RcptTo(MailAddrList),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => fmt.write_fmt(format_args!("{} {}", v, v.id())),
            Self::MailFrom { sender, .. } => fmt.write_fmt(format_args!(
                "MAIL FROM:<{}>",
                sender
                    .as_ref()
                    .map(|f| match f {
                        MailAddr::Group(_) => String::default(),
                        MailAddr::Single(s) => s.addr.clone(),
                    })
                    .unwrap_or_default()
            )),
            Self::RcptTo(rcpt) => fmt.write_fmt(format_args!("RCPT TO:{rcpt}")),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            // Never echo the initial response, it may carry credentials
            Self::Auth { mechanism, .. } => fmt.write_fmt(format_args!("AUTH {mechanism}")),
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

/// Strip one pair of surrounding angle brackets, which clients almost always
/// send but `mailparse` does not require.
fn unbracket(addr: &str) -> &str {
    addr.strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(addr)
}

/// Split the argument of MAIL/RCPT into the address part and any trailing
/// ESMTP parameters.
fn split_address(args: &str) -> (&str, &str) {
    let args = args.trim();

    if args.starts_with('<') {
        if let Some(end) = args.find('>') {
            return (&args[..=end], args[end + 1..].trim_start());
        }
    }

    match args.split_once(char::is_whitespace) {
        Some((addr, params)) => (addr, params.trim_start()),
        None => (args, ""),
    }
}

fn parse_mail_from(command: &str, args: &str) -> Result<Command, Command> {
    let (addr, params) = split_address(args);

    if addr.is_empty() {
        return Err(Command::Invalid(command.to_owned()));
    }

    let mut size = None;
    for param in params.split_whitespace() {
        let upper = param.to_ascii_uppercase();
        if let Some(value) = upper.strip_prefix("SIZE=") {
            match value.parse::<u64>() {
                Ok(value) => size = Some(value),
                Err(_) => return Err(Command::Invalid(command.to_owned())),
            }
        }
    }

    if addr == "<>" {
        return Ok(Command::MailFrom { sender: None, size });
    }

    mailparse::addrparse(unbracket(addr)).map_or_else(
        |err| Err(Command::Invalid(err.to_string())),
        |from| {
            Ok(Command::MailFrom {
                sender: if from.is_empty() {
                    None
                } else {
                    Some(from[0].clone())
                },
                size,
            })
        },
    )
}

fn parse_rcpt_to(command: &str, args: &str) -> Result<Command, Command> {
    let (addr, _) = split_address(args);

    if addr.is_empty() || addr == "<>" {
        return Err(Command::Invalid(command.to_owned()));
    }

    mailparse::addrparse(unbracket(addr)).map_or_else(
        |err| Err(Command::Invalid(err.to_string())),
        |to| {
            if to.is_empty() {
                Err(Command::Invalid(command.to_owned()))
            } else {
                Ok(Command::RcptTo(to))
            }
        },
    )
}

fn parse_auth(args: &str) -> Result<Command, Command> {
    let mut parts = args.split_whitespace();

    match parts.next() {
        None => Err(Command::Invalid("AUTH".to_owned())),
        Some(mechanism) => Ok(Command::Auth {
            mechanism: mechanism.to_ascii_uppercase(),
            initial: parts.next().map(str::to_owned),
        }),
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let comm = command.to_ascii_uppercase();
        let comm = comm.trim();

        if comm.starts_with("MAIL FROM:") {
            parse_mail_from(command, command.trim()[10..].trim())
        } else if comm.starts_with("RCPT TO:") {
            parse_rcpt_to(command, command.trim()[8..].trim())
        } else if comm.starts_with("EHLO") || comm.starts_with("HELO") {
            match command.trim().split_once(' ') {
                None => Err(Self::Invalid(format!("Expected hostname in {comm}"))),
                Some((_, host)) if comm.starts_with('H') => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
            }
        } else if comm.starts_with("AUTH") {
            parse_auth(command.trim()[4..].trim_start())
        } else {
            match comm {
                "DATA" => Ok(Self::Data),
                "RSET" => Ok(Self::Rset),
                "NOOP" => Ok(Self::Noop),
                "QUIT" => Ok(Self::Quit),
                "STARTTLS" => Ok(Self::StartTls),
                _ => Err(Self::Invalid(command.to_owned())),
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or(
            Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
