use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::smtp::TlsContext;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: Server,
    pub smtp: Smtp,
    pub storage: Storage,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Smtp {
    pub hostname: String,
    /// Maximum message size in bytes.
    pub max_size: u64,
    /// Maximum recipients per envelope.
    pub max_recipients: usize,
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Permit AUTH before STARTTLS even when TLS is configured.
    #[serde(default)]
    pub allow_insecure_auth: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tls {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_instance_name() -> String {
    "mailsink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// `ConfigError` when the file cannot be read or parsed, or fails
    /// validation. All of these abort startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(invalid("server host is required"));
        }
        if self.server.port == 0 {
            return Err(invalid("invalid server port"));
        }
        if self.server.instance_name.is_empty() {
            return Err(invalid("server instance name is required"));
        }

        if self.smtp.hostname.is_empty() {
            return Err(invalid("smtp hostname is required"));
        }
        if self.smtp.max_size == 0 {
            return Err(invalid("invalid smtp max size"));
        }
        if self.smtp.max_recipients == 0 {
            return Err(invalid("invalid smtp max recipients"));
        }
        if !self.smtp.allow_anonymous && self.smtp.auth_file.is_none() {
            return Err(invalid(
                "auth file is required when anonymous submission is disabled",
            ));
        }
        if let Some(auth_file) = &self.smtp.auth_file {
            if !auth_file.exists() {
                return Err(ConfigError::Invalid(format!(
                    "auth file not found: {}",
                    auth_file.display()
                )));
            }
        }

        if self.storage.path.as_os_str().is_empty() {
            return Err(invalid("storage path is required"));
        }

        if self.tls.enabled {
            let (Some(cert_file), Some(key_file)) = (&self.tls.cert_file, &self.tls.key_file)
            else {
                return Err(invalid(
                    "cert file and key file are required when TLS is enabled",
                ));
            };

            if !cert_file.exists() {
                return Err(ConfigError::Invalid(format!(
                    "cert file not found: {}",
                    cert_file.display()
                )));
            }
            if !key_file.exists() {
                return Err(ConfigError::Invalid(format!(
                    "key file not found: {}",
                    key_file.display()
                )));
            }
        }

        match self.log.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            level => Err(ConfigError::Invalid(format!("invalid log level: {level}"))),
        }
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub fn tls_context(&self) -> Option<TlsContext> {
        if !self.tls.enabled {
            return None;
        }

        Some(TlsContext {
            certificate: self.tls.cert_file.clone()?,
            key: self.tls.key_file.clone()?,
        })
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests(dir: &Path) -> Self {
        Self {
            server: Server {
                host: "127.0.0.1".to_string(),
                port: 2525,
                instance_name: "test-instance".to_string(),
            },
            smtp: Smtp {
                hostname: "mx.test.example".to_string(),
                max_size: 10 * 1024,
                max_recipients: 10,
                auth_file: None,
                allow_anonymous: true,
                allow_insecure_auth: true,
            },
            storage: Storage {
                path: dir.join("mail"),
            },
            tls: Tls::default(),
            log: Log::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::Config;

    const SAMPLE: &str = r#"
[server]
host = "127.0.0.1"
port = 2525

[smtp]
hostname = "test.local"
max_size = 5242880
max_recipients = 50
allow_anonymous = true

[storage]
path = "./testdata"

[tls]
enabled = false
"#;

    #[test]
    fn loads_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 2525);
        assert_eq!(config.smtp.hostname, "test.local");
        assert_eq!(config.smtp.max_size, 5_242_880);
        assert_eq!(config.server.instance_name, "mailsink");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.listen_addr(), "127.0.0.1:2525");
        assert!(config.tls_context().is_none());
    }

    #[test]
    fn rejects_zero_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.smtp.max_size = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_recipients() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.smtp.max_recipients = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_auth_file_when_anonymous_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.smtp.allow_anonymous = false;

        assert!(config.validate().is_err());

        let auth_file = dir.path().join("users");
        std::fs::write(&auth_file, "alice:secret1\n").unwrap();
        config.smtp.auth_file = Some(auth_file);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn requires_cert_and_key_when_tls_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.tls.enabled = true;

        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.log.level = "verbose".to_string();

        assert!(config.validate().is_err());
    }
}
