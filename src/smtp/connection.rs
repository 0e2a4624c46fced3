use std::{fs::File, io::BufReader, sync::Arc};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
    },
    server::TlsStream,
    TlsAcceptor,
};

use super::session::TlsContext;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("unable to determine key file format")]
    UnknownKeyFormat,
}

#[derive(Debug)]
pub struct TlsInfo {
    version: Option<ProtocolVersion>,
    cipher: Option<SupportedCipherSuite>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version(),
            cipher: conn.negotiated_cipher_suite(),
        }
    }

    pub fn proto(&self) -> String {
        self.version
            .and_then(|version| version.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn cipher(&self) -> String {
        self.cipher
            .and_then(|suite| suite.suite().as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Key strength of the negotiated suite in the `bits/bits` notation used
    /// by Received trace lines.
    pub fn strength(&self) -> String {
        let cipher = self.cipher();

        if cipher.contains("_128_") {
            "128/128".to_string()
        } else if cipher.contains("_256_") || cipher.contains("CHACHA20") {
            "256/256".to_string()
        } else {
            String::default()
        }
    }
}

enum Inner<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: Stream },
    Tls { stream: Box<TlsStream<Stream>> },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Inner<Stream> {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain { stream } => stream.read(buf).await,
            Self::Tls { stream } => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain { stream } => stream.write_all(buf).await,
            Self::Tls { stream } => stream.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain { stream } => stream.flush().await,
            Self::Tls { stream } => stream.flush().await,
        }
    }
}

pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    inner: Inner<Stream>,
    buffer: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self {
            inner: Inner::Plain { stream },
            buffer: Vec::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.inner, Inner::Tls { .. })
    }

    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> Result<(), ConnectionError> {
        self.inner
            .write_all(format!("{response}\r\n").as_bytes())
            .await?;
        self.inner.flush().await?;

        Ok(())
    }

    /// Read one line, without its terminator. LF terminates a line; an
    /// immediately preceding CR is stripped. Returns `None` when the peer
    /// closed the connection before a full line arrived.
    pub(crate) async fn read_line(
        &mut self,
        limit: usize,
    ) -> Result<Option<Vec<u8>>, ConnectionError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                if pos > limit {
                    return Err(ConnectionError::LineTooLong(limit));
                }

                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            if self.buffer.len() > limit {
                return Err(ConnectionError::LineTooLong(limit));
            }

            let mut chunk = [0; 4096];
            let bytes_read = self.inner.read(&mut chunk).await?;
            if bytes_read == 0 {
                return Ok(None);
            }

            self.buffer.extend_from_slice(&chunk[..bytes_read]);
        }
    }

    fn load_certs<P: AsRef<std::path::Path>>(
        path: &P,
    ) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_key<P: AsRef<std::path::Path>>(
        path: &P,
    ) -> Result<PrivateKeyDer<'static>, ConnectionError> {
        let mut reader = BufReader::new(File::open(path)?);

        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(ConnectionError::UnknownKeyFormat),
        }
    }

    /// Perform the server side of a STARTTLS upgrade. Any bytes buffered from
    /// the plaintext phase are discarded, per RFC 3207.
    pub(crate) async fn upgrade(
        self,
        tls_context: &TlsContext,
    ) -> Result<(Self, TlsInfo), ConnectionError> {
        tracing::debug!("Upgrading connection ...");

        let certs = Self::load_certs(&tls_context.certificate)?;
        let key = Self::load_key(&tls_context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));

        match self.inner {
            Inner::Plain { stream } => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1);

                Ok((
                    Self {
                        inner: Inner::Tls {
                            stream: Box::new(stream),
                        },
                        buffer: Vec::new(),
                    },
                    info,
                ))
            }
            Inner::Tls { stream } => {
                let info = TlsInfo::of(stream.get_ref().1);

                Ok((
                    Self {
                        inner: Inner::Tls { stream },
                        buffer: Vec::new(),
                    },
                    info,
                ))
            }
        }
    }
}
