pub mod id;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{MailStore, StoreError};

/// Extras keys recorded alongside each message.
pub const EXTRA_SERVER_NAME: &str = "server_name";
pub const EXTRA_PROTOCOL: &str = "protocol";
pub const EXTRA_TLS_VERSION: &str = "tls_conn";
pub const EXTRA_TLS_CIPHER: &str = "tls_cipher";
pub const EXTRA_TLS_BITS: &str = "tls_bits";

/// Metadata describing one accepted message. Immutable once built; the
/// persisted artifact embeds its serialized form for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailRecord {
    pub id: String,
    pub received_at: DateTime<Utc>,
    /// Authenticated username, empty for anonymous submission.
    pub username: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub client_ip: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
}

impl MailRecord {
    #[must_use]
    pub fn protocol(&self) -> &str {
        self.extras
            .get(EXTRA_PROTOCOL)
            .map_or("ESMTP", String::as_str)
    }
}
