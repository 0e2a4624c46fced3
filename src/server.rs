use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::future::join_all;
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    auth::CredentialStore,
    backend::{Backend, Shared},
    config::Config,
    internal,
    mail::MailStore,
    smtp::{handler::Backend as _, Extension, Session, SessionConfig},
    Signal,
};

pub struct Server {
    shared: Arc<Shared>,
    config_path: Option<PathBuf>,
    shutdown: broadcast::Sender<Signal>,
}

impl Server {
    /// Build a server from a validated configuration. Credentials are loaded
    /// and the storage root created here, before any connection is accepted,
    /// so a bad setup aborts startup.
    ///
    /// # Errors
    ///
    /// Credential or filesystem failures.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let credentials = CredentialStore::default();
        if let Some(auth_file) = &config.smtp.auth_file {
            let count = credentials.load(auth_file)?;
            internal!(level = INFO, "Loaded {count} credential entries");
        }

        std::fs::create_dir_all(&config.storage.path)?;
        let store = MailStore::open(config.storage.path.join("tmp"))?;

        let (shutdown, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(Shared::new(config, credentials, store)),
            config_path,
            shutdown,
        })
    }

    /// Load the configuration file at `path` and build a server from it.
    ///
    /// # Errors
    ///
    /// Configuration, credential, or filesystem failures.
    pub fn from_config<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path = path.into();
        let config = Config::load(&path)?;

        Self::new(config, Some(path))
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Ask the accept loop and every live session to wind down.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);
    }

    /// Bind the configured address and serve until shut down by signal.
    ///
    /// # Errors
    ///
    /// Bind or accept failures.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.shared.config().listen_addr()).await?;
        internal!(level = INFO, "SMTP listener on {}", listener.local_addr()?);

        tokio::spawn(Self::shutdown_on_signal(self.shutdown.clone()));
        Self::reload_on_hangup(Arc::clone(&self.shared), self.config_path.clone());

        self.serve(listener).await
    }

    /// Accept connections from `listener` until a shutdown signal arrives,
    /// then finish the in-flight sessions.
    ///
    /// # Errors
    ///
    /// Accept failures.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let backend = Backend::new(Arc::clone(&self.shared));
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Received shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received from {peer}");

                    let session = Session::create(
                        stream,
                        peer,
                        self.session_config(),
                        backend.new_session(peer),
                    );
                    let receiver = self.shutdown.subscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(receiver).await {
                            internal!(level = ERROR, "{err}");
                        }
                    }));
                }
            }
        }

        Ok(())
    }

    /// Engine parameters for one connection, snapshotted from the current
    /// configuration. Policy limits are still re-read per command behind the
    /// handler.
    fn session_config(&self) -> SessionConfig {
        let config = self.shared.config();

        let mut extensions = vec![
            Extension::Size(config.smtp.max_size),
            Extension::EightBitMime,
        ];
        if config.smtp.auth_file.is_some() || !self.shared.credentials.is_empty() {
            extensions.push(Extension::Auth);
        }

        let tls_context = config.tls_context();
        if tls_context.is_some() {
            extensions.push(Extension::StartTls);
        }

        SessionConfig {
            banner: config.smtp.hostname.clone(),
            extensions,
            tls_context,
            allow_insecure_auth: config.smtp.allow_insecure_auth,
            max_message_size: config.smtp.max_size,
        }
    }

    async fn shutdown_on_signal(shutdown: broadcast::Sender<Signal>) {
        #[cfg(unix)]
        {
            let Ok(mut terminate) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    internal!(level = INFO, "CTRL+C entered, shutting down");
                }
                _ = terminate.recv() => {
                    internal!(level = INFO, "Terminate signal received, shutting down");
                }
            };
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }

        let _ = shutdown.send(Signal::Shutdown);
    }

    /// SIGHUP reloads the configuration file (when the server was built from
    /// one) and the credential file it names. A failed reload keeps the
    /// previous state.
    fn reload_on_hangup(shared: Arc<Shared>, config_path: Option<PathBuf>) {
        #[cfg(unix)]
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };

            while hangup.recv().await.is_some() {
                Self::reload(&shared, config_path.as_deref());
            }
        });

        #[cfg(not(unix))]
        let _ = (shared, config_path);
    }

    fn reload(shared: &Shared, config_path: Option<&Path>) {
        if let Some(path) = config_path {
            match Config::load(path) {
                Ok(config) => {
                    shared.replace_config(config);
                    internal!(level = INFO, "Configuration reloaded");
                }
                Err(err) => {
                    internal!(level = ERROR, "Configuration reload failed, keeping previous: {err}");
                }
            }
        }

        let config = shared.config();
        if let Some(auth_file) = &config.smtp.auth_file {
            match shared.credentials.load(auth_file) {
                Ok(count) => {
                    internal!(level = INFO, "Reloaded {count} credential entries");
                }
                Err(err) => {
                    internal!(level = ERROR, "Credential reload failed, keeping previous: {err}");
                }
            }
        }
    }
}
