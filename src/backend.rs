use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::{
    auth::CredentialStore,
    config::Config,
    internal,
    mail::{
        self, MailRecord, MailStore, EXTRA_PROTOCOL, EXTRA_SERVER_NAME, EXTRA_TLS_BITS,
        EXTRA_TLS_CIPHER, EXTRA_TLS_VERSION,
    },
    smtp::{connection::TlsInfo, Handler, HandlerResult, Reject, Status},
};

/// Process-wide state every session shares: the configuration (readable at
/// call time so a reload applies to new envelope phases), the credential
/// store, and the persister.
#[derive(Debug)]
pub struct Shared {
    config: RwLock<Config>,
    pub credentials: CredentialStore,
    pub store: MailStore,
}

impl Shared {
    pub fn new(config: Config, credentials: CredentialStore, store: MailStore) -> Self {
        Self {
            config: RwLock::new(config),
            credentials,
            store,
        }
    }

    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace_config(&self, config: Config) {
        *self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }
}

/// Creates one [`MailSession`] per accepted connection.
pub struct Backend {
    shared: Arc<Shared>,
}

impl Backend {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

impl crate::smtp::Backend for Backend {
    type Session = MailSession;

    fn new_session(&self, peer: SocketAddr) -> MailSession {
        MailSession::create(Arc::clone(&self.shared), peer)
    }
}

struct TlsParams {
    version: String,
    cipher: String,
    strength: String,
}

/// The per-connection envelope state machine. The protocol engine drives it
/// through the [`Handler`] callbacks; this is where policy lives.
pub struct MailSession {
    shared: Arc<Shared>,
    peer: SocketAddr,
    username: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    tls: Option<TlsParams>,
    accepted: u64,
}

impl MailSession {
    pub fn create(shared: Arc<Shared>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            username: None,
            sender: None,
            recipients: Vec::new(),
            tls: None,
            accepted: 0,
        }
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn require_auth(&self, config: &Config) -> HandlerResult {
        if config.smtp.allow_anonymous || self.username.is_some() {
            Ok(())
        } else {
            Err(Reject::new(
                Status::AuthRequired,
                "Authentication required",
            ))
        }
    }

    fn clear_envelope(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    fn extras(&self, config: &Config) -> HashMap<String, String> {
        let mut extras = HashMap::new();

        extras.insert(
            EXTRA_SERVER_NAME.to_string(),
            config.smtp.hostname.clone(),
        );
        extras.insert(
            EXTRA_PROTOCOL.to_string(),
            if self.tls.is_some() { "ESMTPS" } else { "ESMTP" }.to_string(),
        );

        if let Some(tls) = &self.tls {
            extras.insert(EXTRA_TLS_VERSION.to_string(), tls.version.clone());
            extras.insert(EXTRA_TLS_CIPHER.to_string(), tls.cipher.clone());
            extras.insert(EXTRA_TLS_BITS.to_string(), tls.strength.clone());
        }

        extras
    }

    fn destination(config: &Config, id: &str) -> PathBuf {
        config.storage.path.join(format!("{id}.eml"))
    }
}

#[async_trait]
impl Handler for MailSession {
    async fn authenticate(&mut self, username: &str, secret: &str) -> HandlerResult {
        if self.shared.credentials.authenticate(username, secret) {
            internal!(level = INFO, "Peer {} authenticated as {username}", self.peer);
            self.username = Some(username.to_string());
            Ok(())
        } else {
            tracing::warn!(peer = %self.peer, username, "Authentication failed");
            Err(Reject::new(
                Status::AuthFailed,
                "Authentication credentials invalid",
            ))
        }
    }

    async fn mail_from(&mut self, sender: &str, declared_size: Option<u64>) -> HandlerResult {
        let config = self.shared.config();
        self.require_auth(&config)?;

        if let Some(declared) = declared_size {
            if config.smtp.max_size > 0 && declared > config.smtp.max_size {
                return Err(Reject::new(
                    Status::ExceededStorage,
                    format!(
                        "Message too large, maximum size is {}",
                        config.smtp.max_size
                    ),
                ));
            }
        }

        if !self.recipients.is_empty() {
            tracing::debug!(
                peer = %self.peer,
                discarded = self.recipients.len(),
                "New envelope started, discarding previous recipients"
            );
        }

        // A fresh MAIL always begins a fresh envelope
        self.recipients.clear();
        self.sender = Some(sender.to_string());

        Ok(())
    }

    async fn rcpt_to(&mut self, recipient: &str) -> HandlerResult {
        let config = self.shared.config();
        self.require_auth(&config)?;

        if self.sender.is_none() {
            return Err(Reject::new(
                Status::InvalidCommandSequence,
                "Need MAIL before RCPT",
            ));
        }

        if self.recipients.len() >= config.smtp.max_recipients {
            return Err(Reject::new(
                Status::InsufficientStorage,
                format!(
                    "Too many recipients, maximum is {}",
                    config.smtp.max_recipients
                ),
            ));
        }

        self.recipients.push(recipient.to_string());

        Ok(())
    }

    async fn data(&mut self, body: &[u8]) -> HandlerResult<String> {
        let config = self.shared.config();
        self.require_auth(&config)?;

        if self.recipients.is_empty() {
            return Err(Reject::new(
                Status::InvalidCommandSequence,
                "Need RCPT before DATA",
            ));
        }

        if config.smtp.max_size > 0 && body.len() as u64 > config.smtp.max_size {
            self.clear_envelope();
            return Err(Reject::new(
                Status::ExceededStorage,
                format!(
                    "Message too large, maximum size is {}",
                    config.smtp.max_size
                ),
            ));
        }

        let id = match mail::id::generate(
            &config.server.instance_name,
            self.username.as_deref().unwrap_or_default(),
        ) {
            Ok(id) => id,
            Err(err) => {
                internal!(level = ERROR, "Failed to generate message id: {err}");
                self.clear_envelope();
                return Err(Reject::new(
                    Status::ActionAborted,
                    "Requested action aborted: local error in processing",
                ));
            }
        };

        let record = MailRecord {
            id: id.clone(),
            received_at: chrono::Utc::now(),
            username: self.username.clone().unwrap_or_default(),
            mail_from: self.sender.clone().unwrap_or_default(),
            rcpt_to: self.recipients.clone(),
            client_ip: self.peer.ip().to_string(),
            size: body.len() as u64,
            extras: self.extras(&config),
        };

        let dest = Self::destination(&config, &id);
        let result = self.shared.store.persist(&record, body, &dest).await;

        // Success or failure, the envelope is finished
        self.clear_envelope();

        match result {
            Ok(()) => {
                self.accepted += 1;
                internal!(
                    level = INFO,
                    "Accepted message {id} from {} ({} this session)",
                    self.peer,
                    self.accepted
                );
                Ok(id)
            }
            Err(err) => {
                internal!(level = ERROR, "Failed to persist message {id}: {err}");
                Err(Reject::new(
                    Status::ActionAborted,
                    "Requested action aborted: local error in processing",
                ))
            }
        }
    }

    async fn reset(&mut self) {
        self.clear_envelope();
    }

    async fn logout(&mut self) {
        tracing::debug!(peer = %self.peer, accepted = self.accepted, "Session finished");
    }

    fn tls_established(&mut self, info: &TlsInfo) {
        self.tls = Some(TlsParams {
            version: info.proto(),
            cipher: info.cipher(),
            strength: info.strength(),
        });
    }
}
