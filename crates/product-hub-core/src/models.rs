//! Core data models shared by the sync pipeline and the attachment store.
//!
//! Wiki types ([`WikiPage`], [`WikiTreeItem`]) are ephemeral and only live
//! for the duration of a crawl. [`Product`] and [`Attachment`] are the
//! persisted rows.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a wiki page or folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Current,
    Archived,
    Trashed,
    /// Statuses the wiki may add later (`draft`, `deleted`, ...). Never
    /// treated as current.
    #[serde(other)]
    Other,
}

/// Kind of node in the wiki content tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Page,
    Folder,
    #[serde(other)]
    Other,
}

/// A direct child returned by the wiki's `direct-children` endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiTreeItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: ItemStatus,
    #[serde(rename = "type")]
    pub item_type: ItemType,
}

impl WikiTreeItem {
    pub fn is_current_page(&self) -> bool {
        self.item_type == ItemType::Page && self.status == ItemStatus::Current
    }

    pub fn is_current_folder(&self) -> bool {
        self.item_type == ItemType::Folder && self.status == ItemStatus::Current
    }
}

/// A fetched wiki page with its rendered HTML and the raw firmware cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    pub html: String,
    pub status: ItemStatus,
    /// Link target or plain text of the "Firmware" table row; empty when
    /// the page has no such row.
    pub firmware: String,
}

/// Review status of a product row.
///
/// `Crawler` and `Approved` rows belong to the sync and are replaced on
/// every pass. `Edited` and `Rejected` rows were touched by a human and
/// are never overwritten by a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Crawler,
    Edited,
    Approved,
    Rejected,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Crawler => "crawler",
            ProductStatus::Edited => "edited",
            ProductStatus::Approved => "approved",
            ProductStatus::Rejected => "rejected",
        }
    }

    /// Whether a sync pass may replace a row with this status.
    pub fn is_sync_owned(&self) -> bool {
        matches!(self, ProductStatus::Crawler | ProductStatus::Approved)
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProductStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "crawler" => Ok(ProductStatus::Crawler),
            "edited" => Ok(ProductStatus::Edited),
            "approved" => Ok(ProductStatus::Approved),
            "rejected" => Ok(ProductStatus::Rejected),
            other => bail!("unknown product status: '{}'", other),
        }
    }
}

/// A product row. `id` is the source wiki page id and stays stable across
/// syncs; `code` is the human join key used by attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub code: String,
    pub html: String,
    /// Resolved download URL, or the raw cell text when unresolved.
    pub firmware: String,
    pub status: ProductStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Allowed attachment tags.
pub const ATTACHMENT_TAGS: &[&str] = &["manual", "firmware", "printing", "testing", "certificate"];

/// Allowed attachment statuses.
pub const ATTACHMENT_STATUSES: &[&str] = &[
    "approved",
    "rejected",
    "wrong",
    "draft",
    "archived",
    "deleted",
    "deprecated",
];

pub const TAG_FIRMWARE: &str = "firmware";
pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_DRAFT: &str = "draft";
pub const STATUS_DELETED: &str = "deleted";

/// What happened in an attachment's history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentAction {
    Comment,
    Approve,
    Reject,
    Created,
    Updated,
    Deleted,
}

/// One entry of an attachment's ordered comment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub email: String,
    pub content: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
    pub action: CommentAction,
}

impl Comment {
    pub fn now(email: &str, content: &str, action: CommentAction) -> Self {
        Self {
            email: email.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            action,
        }
    }
}

/// An attachment row.
///
/// `hash` is either the sha256 hex of the stored bytes or a
/// `URL:`-prefixed placeholder meaning the bytes still live remotely at
/// the URL held in `remark`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub hash: String,
    pub name: String,
    pub size: i64,
    pub mimetype: String,
    pub status: String,
    pub download_count: i64,
    pub remark: String,
    pub tag: String,
    pub product_code: String,
    pub comments: Vec<Comment>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Attachment {
    /// True while the bytes have not been fetched into local storage.
    pub fn is_placeholder(&self) -> bool {
        crate::hash::is_placeholder(&self.hash)
    }

    /// A firmware row written by the sync rather than a user upload.
    pub fn is_sync_firmware(&self) -> bool {
        self.tag == TAG_FIRMWARE && self.is_placeholder()
    }
}

/// Fields for a new attachment row; the store assigns `id` and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewAttachment {
    pub hash: String,
    pub name: String,
    pub size: i64,
    pub mimetype: String,
    pub status: String,
    pub remark: String,
    pub tag: String,
    pub product_code: String,
    pub comments: Vec<Comment>,
}

/// Row written by the firmware upsert. Only these columns are overwritten
/// when the id already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareAttachment {
    pub id: i64,
    pub hash: String,
    pub name: String,
    pub product_code: String,
    pub remark: String,
    pub status: String,
    pub tag: String,
}

/// Partial metadata update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentUpdate {
    pub name: Option<String>,
    pub remark: Option<String>,
    pub tag: Option<String>,
    pub status: Option<String>,
    pub download_count: Option<i64>,
    pub product_code: Option<String>,
}

impl AttachmentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.remark.is_none()
            && self.tag.is_none()
            && self.status.is_none()
            && self.download_count.is_none()
            && self.product_code.is_none()
    }
}

/// Listing parameters for attachments.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentQuery {
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub product_code: String,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Return only `id, name, product_code, tag, status`.
    #[serde(default)]
    pub fast: bool,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    60
}

impl Default for AttachmentQuery {
    fn default() -> Self {
        Self {
            search: String::new(),
            product_code: String::new(),
            page: default_page(),
            limit: default_limit(),
            fast: false,
        }
    }
}

impl AttachmentQuery {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit.max(0)
    }
}

/// A page of results plus the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub rows: Vec<T>,
}
