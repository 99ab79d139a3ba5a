//! Wiki connector: page tree crawl and firmware cell extraction.
//!
//! Enumerates every `current` page reachable from a root page through its
//! `current` folders, then fetches each page's rendered HTML in fixed-size
//! batches so the wiki never sees more than `batch_size` concurrent page
//! requests.
//!
//! # Configuration
//!
//! ```toml
//! [wiki]
//! base_url = "https://acme.atlassian.net"
//! user_email = "sync-bot@acme.com"
//! root_page_id = "1414955057"
//! # timeout_secs = 60
//! # max_retries = 3
//! # batch_size = 5
//! ```
//!
//! # Environment Variables
//!
//! - `WIKI_API_TOKEN`: API token, sent with `user_email` as HTTP Basic auth.
//!
//! # Endpoints
//!
//! | Call | Path |
//! |------|------|
//! | children of page | `GET /wiki/api/v2/pages/{id}/direct-children?limit=250` |
//! | children of folder | `GET /wiki/api/v2/folders/{id}/direct-children?limit=250` |
//! | page by id | `GET /wiki/api/v2/pages/{id}?body-format=anonymous_export_view` |

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::{join_all, try_join_all, BoxFuture};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use product_hub_core::models::{ItemStatus, WikiPage, WikiTreeItem};

use crate::config::{secret_from_env, WikiConfig};
use crate::error::FetchError;
use crate::retry::{with_timeout_retry, RetryPolicy};

// ═══════════════════════════════════════════════════════════════════════
// API trait
// ═══════════════════════════════════════════════════════════════════════

/// The subset of the wiki API the crawler needs.
///
/// Implementations perform a single attempt per call; timeouts and retries
/// are applied by [`WikiTreeCrawler`].
#[async_trait]
pub trait WikiApi: Send + Sync {
    async fn children_of_page(&self, page_id: &str) -> Result<Vec<WikiTreeItem>, FetchError>;

    async fn children_of_folder(&self, folder_id: &str) -> Result<Vec<WikiTreeItem>, FetchError>;

    /// Fetch a page with its rendered HTML and extracted firmware cell.
    async fn page_by_id(&self, page_id: &str) -> Result<WikiPage, FetchError>;
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP client
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct ChildrenResponse {
    #[serde(default)]
    results: Vec<WikiTreeItem>,
}

#[derive(Deserialize)]
struct PageResponse {
    id: String,
    #[serde(default)]
    title: String,
    status: ItemStatus,
    #[serde(default)]
    body: Option<PageBody>,
}

#[derive(Deserialize)]
struct PageBody {
    #[serde(default)]
    anonymous_export_view: Option<BodyValue>,
}

#[derive(Deserialize)]
struct BodyValue {
    #[serde(default)]
    value: String,
}

/// reqwest-backed [`WikiApi`] using HTTP Basic auth.
pub struct WikiClient {
    http: reqwest::Client,
    base_url: String,
    user_email: String,
    api_token: String,
}

impl WikiClient {
    pub fn new(base_url: &str, user_email: &str, api_token: &str) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::from_reqwest("wiki client", e))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_email: user_email.to_string(),
            api_token: api_token.to_string(),
        })
    }

    /// Build a client from config, reading `WIKI_API_TOKEN` from the environment.
    pub fn from_config(config: &WikiConfig) -> anyhow::Result<Self> {
        let token = secret_from_env("WIKI_API_TOKEN")?;
        Ok(Self::new(&config.base_url, &config.user_email, &token)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, target: &str, url: &str) -> Result<T, FetchError> {
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.user_email, Some(&self.api_token))
            .header("Accept", "application/json")
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

        resp.json::<T>()
            .await
            .map_err(|e| FetchError::from_reqwest(target, e))
    }
}

#[async_trait]
impl WikiApi for WikiClient {
    async fn children_of_page(&self, page_id: &str) -> Result<Vec<WikiTreeItem>, FetchError> {
        let url = format!(
            "{}/wiki/api/v2/pages/{}/direct-children?limit=250",
            self.base_url, page_id
        );
        let resp: ChildrenResponse = self.get_json(&format!("page {}", page_id), &url).await?;
        Ok(resp.results)
    }

    async fn children_of_folder(&self, folder_id: &str) -> Result<Vec<WikiTreeItem>, FetchError> {
        let url = format!(
            "{}/wiki/api/v2/folders/{}/direct-children?limit=250",
            self.base_url, folder_id
        );
        let resp: ChildrenResponse = self.get_json(&format!("folder {}", folder_id), &url).await?;
        Ok(resp.results)
    }

    async fn page_by_id(&self, page_id: &str) -> Result<WikiPage, FetchError> {
        let url = format!(
            "{}/wiki/api/v2/pages/{}?body-format=anonymous_export_view",
            self.base_url, page_id
        );
        let resp: PageResponse = self.get_json(&format!("page {}", page_id), &url).await?;
        let html = resp
            .body
            .and_then(|b| b.anonymous_export_view)
            .map(|v| v.value)
            .unwrap_or_default();
        let firmware = parse_firmware(&html);
        Ok(WikiPage {
            id: resp.id,
            title: resp.title,
            html,
            status: resp.status,
            firmware,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Firmware cell extraction
// ═══════════════════════════════════════════════════════════════════════

fn selector(cell: &'static OnceLock<Selector>, css: &'static str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("static selector"))
}

/// Extract the firmware reference from a page's rendered HTML.
///
/// Finds the first table row whose first header cell contains "Firmware"
/// and returns the link target of its second cell, falling back to the
/// cell's trimmed text. Returns an empty string when no row matches.
pub fn parse_firmware(html: &str) -> String {
    static ROW: OnceLock<Selector> = OnceLock::new();
    static TH: OnceLock<Selector> = OnceLock::new();
    static CELL: OnceLock<Selector> = OnceLock::new();
    static LINK: OnceLock<Selector> = OnceLock::new();

    let doc = Html::parse_document(html);
    for row in doc.select(selector(&ROW, "table > tbody > tr")) {
        let header = match row.select(selector(&TH, "th")).next() {
            Some(th) => th.text().collect::<String>(),
            None => continue,
        };
        if !header.trim().contains("Firmware") {
            continue;
        }
        let Some(cell) = row.select(selector(&CELL, "td:nth-child(2)")).next() else {
            return String::new();
        };
        if let Some(href) = cell
            .select(selector(&LINK, "a"))
            .next()
            .and_then(|a| a.value().attr("href"))
        {
            return href.to_string();
        }
        return cell.text().collect::<String>().trim().to_string();
    }
    String::new()
}

// ═══════════════════════════════════════════════════════════════════════
// Crawler
// ═══════════════════════════════════════════════════════════════════════

/// Recursive page-tree crawler with batched page fetches.
pub struct WikiTreeCrawler {
    api: Arc<dyn WikiApi>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl WikiTreeCrawler {
    pub fn new(api: Arc<dyn WikiApi>, policy: RetryPolicy, batch_size: usize) -> Self {
        Self {
            api,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(api: Arc<dyn WikiApi>, config: &WikiConfig) -> Self {
        Self::new(
            api,
            RetryPolicy::new(config.timeout_secs, config.max_retries),
            config.batch_size,
        )
    }

    /// Crawl everything under `root_page_id` and fetch each current page.
    ///
    /// Only `current` folders directly under the root are descended into;
    /// pages sitting directly under the root are not products. The crawl
    /// is all-or-nothing: the first terminal fetch error aborts it.
    pub async fn fetch_products(&self, root_page_id: &str) -> Result<Vec<WikiPage>, FetchError> {
        let root_children = with_timeout_retry(
            &format!("page {}", root_page_id),
            self.policy,
            || self.api.children_of_page(root_page_id),
        )
        .await?;

        let folders: Vec<&WikiTreeItem> = root_children
            .iter()
            .filter(|item| item.is_current_folder())
            .collect();
        debug!(root = %root_page_id, folders = folders.len(), "listing product folders");

        let per_folder =
            try_join_all(folders.iter().map(|folder| self.pages_in_folder(&folder.id))).await?;
        let items: Vec<WikiTreeItem> = per_folder.into_iter().flatten().collect();
        info!(pages = items.len(), "wiki tree enumerated");

        let mut pages = Vec::with_capacity(items.len());
        for batch in items.chunks(self.batch_size) {
            // The whole batch settles before the next one starts.
            let results = join_all(batch.iter().map(|item| self.page(&item.id))).await;
            for result in results {
                pages.push(result?);
            }
        }
        Ok(pages)
    }

    /// Depth-first expansion of a folder into its current pages.
    fn pages_in_folder<'a>(
        &'a self,
        folder_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<WikiTreeItem>, FetchError>> {
        Box::pin(async move {
            let children = with_timeout_retry(
                &format!("folder {}", folder_id),
                self.policy,
                || self.api.children_of_folder(folder_id),
            )
            .await?;

            let mut pages: Vec<WikiTreeItem> = children
                .iter()
                .filter(|item| item.is_current_page())
                .cloned()
                .collect();

            let nested = try_join_all(
                children
                    .iter()
                    .filter(|item| item.is_current_folder())
                    .map(|folder| self.pages_in_folder(&folder.id)),
            )
            .await?;
            pages.extend(nested.into_iter().flatten());
            Ok(pages)
        })
    }

    async fn page(&self, page_id: &str) -> Result<WikiPage, FetchError> {
        with_timeout_retry(&format!("page {}", page_id), self.policy, || {
            self.api.page_by_id(page_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_firmware_link() {
        let html = r#"
            <table><tbody>
              <tr><th>Model</th><td>Plug S</td></tr>
              <tr><th><strong>Firmware</strong> version</th>
                  <td><a href="https://gitlab.example.com/Shelly/fw/shelly-ng/-/issues/3488">#3488</a></td></tr>
            </tbody></table>"#;
        assert_eq!(
            parse_firmware(html),
            "https://gitlab.example.com/Shelly/fw/shelly-ng/-/issues/3488"
        );
    }

    #[test]
    fn test_parse_firmware_plain_text() {
        let html = "<table><tr><th>Firmware</th><td>  1.4.2-beta  </td></tr></table>";
        assert_eq!(parse_firmware(html), "1.4.2-beta");
    }

    #[test]
    fn test_parse_firmware_missing_row() {
        let html = "<p>No table here</p><table><tr><th>Model</th><td>X</td></tr></table>";
        assert_eq!(parse_firmware(html), "");
        assert_eq!(parse_firmware(""), "");
    }

    #[test]
    fn test_parse_firmware_first_row_wins() {
        let html = r#"<table><tbody>
            <tr><th>Firmware</th><td><a href="/first">a</a></td></tr>
            <tr><th>Firmware (old)</th><td><a href="/second">b</a></td></tr>
        </tbody></table>"#;
        assert_eq!(parse_firmware(html), "/first");
    }
}
