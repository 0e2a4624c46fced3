use core::fmt::{self, Display};

/// Capabilities advertised in the EHLO response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extension {
    Size(u64),
    StartTls,
    Auth,
    EightBitMime,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(limit) => fmt.write_fmt(format_args!("SIZE {limit}")),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth => fmt.write_str("AUTH PLAIN LOGIN"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Extension;

    #[test]
    fn advertisement() {
        assert_eq!(Extension::Size(10240).to_string(), "SIZE 10240");
        assert_eq!(Extension::StartTls.to_string(), "STARTTLS");
        assert_eq!(Extension::Auth.to_string(), "AUTH PLAIN LOGIN");
        assert_eq!(Extension::EightBitMime.to_string(), "8BITMIME");
    }
}
