//! Typed errors for the sync pipeline and the attachment store.
//!
//! Remote fetch failures are split into transient ([`FetchError::Timeout`],
//! retried by the crawler) and permanent (everything else). Sync failures
//! name the stage that failed so a wiki outage, a tracker outage and a
//! storage fault are distinguishable. Download failures keep "not found"
//! apart from storage-layer faults.

use thiserror::Error;

/// A failed call to a remote API (wiki or tracker).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {target} timed out")]
    Timeout { target: String },

    #[error("failed to fetch {target} after {attempts} attempts: request timeout")]
    RetriesExhausted { target: String, attempts: u32 },

    #[error("failed to fetch {target}: HTTP {status}: {body}")]
    Status {
        target: String,
        status: u16,
        body: String,
    },

    #[error("failed to fetch {target}: {message}")]
    Transport { target: String, message: String },

    #[error("malformed response for {target}: {message}")]
    Decode { target: String, message: String },

    #[error("invalid upload URL '{0}': expected <host>/-/project/<id>/uploads/<hex>/<file>")]
    InvalidUploadUrl(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }

    /// Classify a reqwest error for `target`.
    pub fn from_reqwest(target: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                target: target.to_string(),
            }
        } else if err.is_decode() {
            FetchError::Decode {
                target: target.to_string(),
                message: err.to_string(),
            }
        } else {
            FetchError::Transport {
                target: target.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// A failed synchronous sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("wiki crawl failed: {0}")]
    Crawl(#[source] FetchError),

    #[error("firmware resolution failed: {0}")]
    Resolve(#[source] FetchError),

    #[error("product reconciliation failed: {0}")]
    Reconcile(#[source] anyhow::Error),

    #[error("firmware attachment upsert failed: {0}")]
    Attachment(#[source] anyhow::Error),
}

impl SyncError {
    /// Short stage label for logs and API error codes.
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Crawl(_) => "crawl",
            SyncError::Resolve(_) => "resolve",
            SyncError::Reconcile(_) => "reconcile",
            SyncError::Attachment(_) => "attachment",
        }
    }
}

/// A failed attachment download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no attachment with hash {0}")]
    RecordNotFound(String),

    #[error("blob {0} not found in storage")]
    BlobNotFound(String),

    #[error("remote file for attachment {id} could not be fetched: {source}")]
    RemoteFetch {
        id: i64,
        #[source]
        source: FetchError,
    },

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl DownloadError {
    /// Everything except a storage-layer fault reads as "not found".
    pub fn is_not_found(&self) -> bool {
        !matches!(self, DownloadError::Storage(_))
    }
}

/// A failed attachment metadata operation.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment {0} not found")]
    NotFound(i64),

    #[error("invalid {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<anyhow::Error> for AttachmentError {
    fn from(err: anyhow::Error) -> Self {
        AttachmentError::Storage(err)
    }
}
