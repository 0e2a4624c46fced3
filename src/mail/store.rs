use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};

use super::{MailRecord, EXTRA_TLS_BITS, EXTRA_TLS_CIPHER, EXTRA_TLS_VERSION};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failure: {0}")]
    Storage(#[source] std::io::Error),

    #[error("failed to serialize mail record: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("message transfer failed: {0}")]
    Transfer(#[source] std::io::Error),
}

/// Writes one artifact per accepted message: a synthetic header block
/// followed by the body, committed with an atomic rename so a destination
/// path either does not exist or holds the complete artifact.
#[derive(Debug)]
pub struct MailStore {
    scratch: PathBuf,
}

impl MailStore {
    /// Create a store whose temporary files live under `scratch`. Keep the
    /// scratch area on the same filesystem as the destination paths so the
    /// final rename cannot degrade into a copy.
    ///
    /// # Errors
    ///
    /// `StoreError::Storage` if the scratch directory cannot be created.
    pub fn open<P: Into<PathBuf>>(scratch: P) -> Result<Self, StoreError> {
        let scratch = scratch.into();
        std::fs::create_dir_all(&scratch).map_err(StoreError::Storage)?;

        Ok(Self { scratch })
    }

    /// Persist `record` plus `body` to `dest`.
    ///
    /// The artifact is staged in the scratch area, flushed to stable
    /// storage, and renamed into place; nothing is ever visible at `dest`
    /// until the rename. Every failure beforehand removes the staged file.
    ///
    /// # Errors
    ///
    /// `Serialization` if the record cannot be rendered, `Transfer` if the
    /// body stream fails mid-copy, `Storage` for any filesystem failure.
    pub async fn persist<R>(
        &self,
        record: &MailRecord,
        body: R,
        dest: &Path,
    ) -> Result<(), StoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let headers = render_headers(record)?;
        let staged = self.scratch.join(format!("{}.tmp", record.id));

        let result = write_artifact(&staged, &headers, body, dest).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }

        result
    }
}

async fn write_artifact<R>(
    staged: &Path,
    headers: &str,
    mut body: R,
    dest: &Path,
) -> Result<(), StoreError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut file = File::create(staged).await.map_err(StoreError::Storage)?;

    file.write_all(headers.as_bytes())
        .await
        .map_err(StoreError::Storage)?;

    let mut chunk = [0; 8192];
    loop {
        let bytes_read = body.read(&mut chunk).await.map_err(StoreError::Transfer)?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&chunk[..bytes_read])
            .await
            .map_err(StoreError::Storage)?;
    }

    file.sync_all().await.map_err(StoreError::Storage)?;
    drop(file);

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StoreError::Storage)?;
    }

    tokio::fs::rename(staged, dest)
        .await
        .map_err(StoreError::Storage)
}

/// Render the synthetic header block: the embedded record, a Received
/// trace, the Message-ID, and the received date. The body follows directly,
/// its own headers continuing the block.
fn render_headers(record: &MailRecord) -> Result<String, StoreError> {
    let json = serde_json::to_string(record).map_err(StoreError::Serialization)?;
    let date = record.received_at.to_rfc2822();
    let client = &record.client_ip;

    let tls_info = record.extras.get(EXTRA_TLS_VERSION).map_or_else(
        String::default,
        |version| {
            format!(
                "\r\n        (version={} cipher={} bits={})",
                version,
                record
                    .extras
                    .get(EXTRA_TLS_CIPHER)
                    .map_or("", String::as_str),
                record
                    .extras
                    .get(EXTRA_TLS_BITS)
                    .map_or("", String::as_str),
            )
        },
    );

    let server_name = record
        .extras
        .get(super::EXTRA_SERVER_NAME)
        .map_or("localhost", String::as_str);

    Ok(format!(
        "X-Mailsink-Record: {json}\r\n\
         Received: from {client} ([{client}])\r\n        \
         by {server_name} with {protocol} id {id}\r\n        \
         for <{recipients}>{tls_info};\r\n        \
         {date}\r\n\
         Message-ID: <{id}@{server_name}>\r\n\
         Date: {date}\r\n",
        protocol = record.protocol(),
        id = record.id,
        recipients = record.rcpt_to.join(", "),
    ))
}
