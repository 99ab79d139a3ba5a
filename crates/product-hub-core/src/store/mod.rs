//! Row storage abstraction for products and attachments.
//!
//! The sync pipeline and the attachment service only talk to these traits,
//! so the relational backend (SQLite in the main crate) and the in-memory
//! backend used by tests are interchangeable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    Attachment, AttachmentQuery, AttachmentUpdate, Comment, FirmwareAttachment, NewAttachment,
    Paged, Product,
};

/// Result of reconciling a freshly crawled product generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProductSyncOutcome {
    /// Rows written by this pass, in input order.
    pub inserted: Vec<Product>,
    /// Ids left alone because a human-owned row (`edited`/`rejected`)
    /// already exists under that id.
    pub skipped: Vec<String>,
}

/// Product persistence.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`sync_products`](ProductStore::sync_products) | Replace sync-owned rows with a new generation |
/// | [`get_product`](ProductStore::get_product) | Lookup by id |
/// | [`list_products`](ProductStore::list_products) | Code search with pagination |
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Replace the previous crawl generation with `rows`, atomically.
    ///
    /// Rows whose id is held by a `crawler`/`approved` row replace it. Ids
    /// held by an `edited`/`rejected` row are skipped and reported. Rows
    /// for ids absent from `rows` are untouched.
    async fn sync_products(&self, rows: &[Product]) -> Result<ProductSyncOutcome>;

    async fn get_product(&self, id: &str) -> Result<Option<Product>>;

    /// Case-insensitive substring search on `code`, ordered by status.
    async fn list_products(&self, search: &str, page: i64, limit: i64) -> Result<Paged<Product>>;
}

/// Attachment row persistence. Blob bytes are not handled here.
#[async_trait]
pub trait AttachmentRepo: Send + Sync {
    async fn insert_attachment(&self, row: &NewAttachment) -> Result<Attachment>;

    /// Insert `row` under its explicit id, or overwrite the firmware
    /// columns of the existing row with that id.
    ///
    /// Only a sync-written row (tag `firmware` with a `URL:` placeholder
    /// hash) may be overwritten. When any other attachment already holds
    /// the id it is left untouched and `None` is returned.
    async fn upsert_firmware_attachment(
        &self,
        row: &FirmwareAttachment,
    ) -> Result<Option<Attachment>>;

    async fn get_attachment(&self, id: i64) -> Result<Option<Attachment>>;

    /// First row carrying `hash`. Duplicates are tolerated; the lowest id wins.
    async fn find_attachment_by_hash(&self, hash: &str) -> Result<Option<Attachment>>;

    async fn list_attachments(&self, query: &AttachmentQuery) -> Result<Paged<Attachment>>;

    /// Apply `update` and append `comment`. Returns `None` if the id is unknown.
    async fn update_attachment(
        &self,
        id: i64,
        update: &AttachmentUpdate,
        comment: Option<Comment>,
    ) -> Result<Option<Attachment>>;

    async fn increment_download_count(&self, id: i64) -> Result<()>;
}

/// Lowercase `needle` match used by both backends for attachment search.
pub fn attachment_matches(row: &Attachment, query: &AttachmentQuery) -> bool {
    if !query.product_code.is_empty() && row.product_code != query.product_code {
        return false;
    }
    if query.search.is_empty() {
        return true;
    }
    let needle = query.search.to_lowercase();
    row.remark.to_lowercase().contains(&needle)
        || row.name.to_lowercase().contains(&needle)
        || row.product_code == query.search
}

/// Reduce a row to the columns returned by a "fast" listing.
pub fn fast_view(row: &Attachment) -> Attachment {
    Attachment {
        id: row.id,
        hash: String::new(),
        name: row.name.clone(),
        size: 0,
        mimetype: String::new(),
        status: row.status.clone(),
        download_count: 0,
        remark: String::new(),
        tag: row.tag.clone(),
        product_code: row.product_code.clone(),
        comments: Vec::new(),
        created_at: 0,
        updated_at: 0,
    }
}
