//! Firmware link helpers.
//!
//! The wiki's "Firmware" cell usually links to an issue in the tracker. The
//! issue description carries a line such as
//!
//! ```text
//! Production bundle: **[2451-ProDimmer.zip](/uploads/276e95c6/2451-ProDimmer.zip)**
//! ```
//!
//! and the relative upload path is rewritten into an absolute URL under the
//! project's upload namespace. Everything here is pure string handling; the
//! network side lives in the tracker client.

use std::sync::OnceLock;

use regex::Regex;

/// Marker that identifies an upload-style URL (a concrete uploaded file).
pub const UPLOAD_MARKER: &str = "/uploads/";

const ISSUE_SEPARATOR: &str = "/-/issues/";
const PROJECT_UPLOAD_SEGMENT: &str = "/-/project/";
const API_PROJECT_SEGMENT: &str = "/api/v4/projects/";

/// Where issues and uploads live in the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerLayout {
    /// Tracker origin without trailing slash, e.g. `https://gitlab.example.com`.
    pub base_url: String,
    /// Namespaced project path, e.g. `Shelly/fw/shelly-ng`.
    pub project_path: String,
    /// Numeric project id used by the API and upload URLs, e.g. `755`.
    pub project_id: String,
}

impl TrackerLayout {
    pub fn new(
        base_url: impl Into<String>,
        project_path: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_path: project_path.into().trim_matches('/').to_string(),
            project_id: project_id.into(),
        }
    }

    /// `<base>/<project path>/-/issues/`
    pub fn issue_prefix(&self) -> String {
        format!("{}/{}{}", self.base_url, self.project_path, ISSUE_SEPARATOR)
    }

    /// Whether `raw` points at an issue of the configured project.
    pub fn is_issue_url(&self, raw: &str) -> bool {
        raw.starts_with(&self.issue_prefix())
    }

    /// Absolute download URL for a relative `/uploads/...` path.
    pub fn upload_url(&self, upload_path: &str) -> String {
        format!(
            "{}{}{}{}",
            self.base_url, PROJECT_UPLOAD_SEGMENT, self.project_id, upload_path
        )
    }

    /// Whether `url` is an upload URL hosted by this tracker.
    ///
    /// The base URL must be followed by a path separator, so a longer host
    /// (`gitlab.example.com.evil.net`) or port (`:12345` vs `:1234`) that
    /// merely shares the prefix is not the tracker.
    pub fn is_tracker_upload(&self, url: &str) -> bool {
        url.strip_prefix(self.base_url.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
            && is_upload_url(url)
    }
}

pub fn is_upload_url(value: &str) -> bool {
    value.contains(UPLOAD_MARKER)
}

/// Parse the issue number from an issue URL.
///
/// Reads the leading digits after `/-/issues/`, so anchors and query
/// strings (`.../issues/3488#note_1`) are tolerated. Returns `None` when
/// there is no positive number to read.
pub fn parse_issue_iid(url: &str) -> Option<u64> {
    let mut parts = url.split(ISSUE_SEPARATOR);
    let _head = parts.next()?;
    let tail = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(iid) => Some(iid),
    }
}

/// First line mentioning a production bundle archive.
///
/// The "production bundle" match is case-insensitive; ".zip" is matched
/// as written.
pub fn find_bundle_line(markdown: &str) -> Option<&str> {
    markdown
        .lines()
        .find(|line| line.to_lowercase().contains("production bundle") && line.contains(".zip"))
}

fn upload_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((/uploads/[^)]+\.zip)\)").expect("static regex"))
}

/// First markdown link target of the form `(/uploads/....zip)` in `line`.
pub fn extract_upload_path(line: &str) -> Option<&str> {
    upload_link_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Rewrite a browser upload URL into its API download form.
///
/// `https://host/-/project/755/uploads/<id>/<file>` becomes
/// `https://host/api/v4/projects/755/uploads/<id>/<file>`. Returns `None`
/// for URLs that are not project uploads.
pub fn api_download_url(url: &str) -> Option<String> {
    if !url.contains(PROJECT_UPLOAD_SEGMENT) || !url.contains(UPLOAD_MARKER) {
        return None;
    }
    Some(url.replacen(PROJECT_UPLOAD_SEGMENT, API_PROJECT_SEGMENT, 1))
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn file_name(url: &str) -> String {
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "downloaded_file".to_string(),
    }
}
