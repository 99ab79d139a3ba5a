//! Issue tracker connector and firmware link resolution.
//!
//! A product's wiki "Firmware" cell usually points at a tracker issue. The
//! resolver reads that issue's description, finds the production bundle
//! line, and rewrites its relative `/uploads/...zip` link into an absolute
//! download URL. The same client fetches upload bytes when an attachment
//! is materialized.
//!
//! # Configuration
//!
//! ```toml
//! [tracker]
//! base_url = "https://gitlab.example.com"
//! project_path = "Shelly/fw/shelly-ng"
//! project_id = "755"
//! # accept_invalid_certs = false
//! # strict = false
//! ```
//!
//! # Environment Variables
//!
//! - `TRACKER_TOKEN`: personal access token, sent as `PRIVATE-TOKEN`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use product_hub_core::firmware::{
    api_download_url, extract_upload_path, file_name, find_bundle_line, parse_issue_iid,
    TrackerLayout,
};
use product_hub_core::hash::sha256_hex;

use crate::config::{secret_from_env, TrackerConfig};
use crate::error::FetchError;

/// Bytes and metadata of a file fetched from the tracker.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub filename: String,
    /// sha256 hex of `bytes`.
    pub sha256: String,
    pub mimetype: String,
    pub size: i64,
    pub bytes: Vec<u8>,
}

/// Tracker calls used by the resolver and the attachment store.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    /// Markdown description of issue `iid`. A missing description is `""`.
    async fn issue_description(&self, project_id: &str, iid: u64) -> Result<String, FetchError>;

    /// Fetch an upload by its browser URL (`.../-/project/<id>/uploads/...`).
    async fn download_upload(&self, url: &str) -> Result<RemoteFile, FetchError>;
}

#[derive(Deserialize)]
struct IssueResponse {
    #[serde(default)]
    description: Option<String>,
}

/// reqwest-backed [`TrackerApi`].
pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TrackerClient {
    /// `accept_invalid_certs` applies to this client only.
    pub fn new(base_url: &str, token: &str, accept_invalid_certs: bool) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| FetchError::from_reqwest("tracker client", e))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Build a client from config, reading `TRACKER_TOKEN` from the environment.
    pub fn from_config(config: &TrackerConfig) -> anyhow::Result<Self> {
        let token = secret_from_env("TRACKER_TOKEN")?;
        Ok(Self::new(
            &config.base_url,
            &token,
            config.accept_invalid_certs,
        )?)
    }

    async fn get(&self, target: &str, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(target, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                target: target.to_string(),
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(resp)
    }
}

/// Percent-encode a path segment (RFC 3986 unreserved characters pass).
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[async_trait]
impl TrackerApi for TrackerClient {
    async fn issue_description(&self, project_id: &str, iid: u64) -> Result<String, FetchError> {
        let target = format!("issue {}", iid);
        let url = format!(
            "{}/api/v4/projects/{}/issues/{}",
            self.base_url,
            encode_segment(project_id),
            iid
        );
        let issue: IssueResponse = self
            .get(&target, &url)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::from_reqwest(&target, e))?;
        Ok(issue.description.unwrap_or_default())
    }

    async fn download_upload(&self, url: &str) -> Result<RemoteFile, FetchError> {
        let api_url =
            api_download_url(url).ok_or_else(|| FetchError::InvalidUploadUrl(url.to_string()))?;
        let resp = self.get(url, &api_url).await?;

        let mimetype = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length = resp.content_length();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?
            .to_vec();

        Ok(RemoteFile {
            filename: file_name(url),
            sha256: sha256_hex(&bytes),
            mimetype,
            size: content_length.map(|n| n as i64).unwrap_or(bytes.len() as i64),
            bytes,
        })
    }
}

/// Rewrites tracker issue links into production bundle download URLs.
pub struct FirmwareLinkResolver {
    api: Arc<dyn TrackerApi>,
    layout: TrackerLayout,
    strict: bool,
}

impl FirmwareLinkResolver {
    pub fn new(api: Arc<dyn TrackerApi>, layout: TrackerLayout, strict: bool) -> Self {
        Self {
            api,
            layout,
            strict,
        }
    }

    pub fn from_config(api: Arc<dyn TrackerApi>, config: &TrackerConfig) -> Self {
        Self::new(api, config.layout(), config.strict)
    }

    pub fn layout(&self) -> &TrackerLayout {
        &self.layout
    }

    /// Resolve `raw` to a bundle download URL, or return it unchanged.
    ///
    /// Values that are not issue links of the configured project, issues
    /// without a production bundle line, and bundle lines without an
    /// upload link all pass through unchanged. A failed issue fetch also
    /// passes through with a warning unless the resolver is strict, in
    /// which case the error is returned.
    pub async fn resolve(&self, raw: &str) -> Result<String, FetchError> {
        if !self.layout.is_issue_url(raw) {
            return Ok(raw.to_string());
        }

        let Some(iid) = parse_issue_iid(raw) else {
            warn!(firmware = %raw, "could not parse issue number");
            return Ok(raw.to_string());
        };

        let description = match self.api.issue_description(&self.layout.project_id, iid).await {
            Ok(d) => d,
            Err(e) if self.strict => return Err(e),
            Err(e) => {
                warn!(firmware = %raw, error = %e, "issue fetch failed, keeping raw value");
                return Ok(raw.to_string());
            }
        };

        let Some(line) = find_bundle_line(&description) else {
            warn!(issue = iid, "no production bundle line in issue");
            return Ok(raw.to_string());
        };

        let Some(path) = extract_upload_path(line) else {
            warn!(issue = iid, line = %line, "production bundle line has no upload link");
            return Ok(raw.to_string());
        };

        let resolved = self.layout.upload_url(path);
        debug!(issue = iid, url = %resolved, "resolved firmware bundle");
        Ok(resolved)
    }
}
