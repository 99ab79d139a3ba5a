//! One full synchronization pass.
//!
//! ```text
//! crawl ─▶ resolve firmware ─▶ build products ─▶ reconcile (1 txn)
//!       ─▶ upsert firmware attachments ─▶ return ─▶ materialize (background)
//! ```
//!
//! The synchronous stages are all-or-nothing: the first fatal error is
//! returned as a [`SyncError`] naming the stage. Products whose id is held
//! by a manually edited or rejected row are skipped and reported, and get
//! no firmware attachment.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{info, warn};

use product_hub_core::firmware::is_upload_url;
use product_hub_core::models::{Product, ProductStatus, WikiPage};
use product_hub_core::store::ProductStore;

use crate::attachments::{AttachmentService, FirmwareUpsert};
use crate::error::SyncError;
use crate::materialize::{MaterializeHandle, Materializer};
use crate::tracker::FirmwareLinkResolver;
use crate::wiki::WikiTreeCrawler;

/// What a sync pass wrote.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Products written by this pass, in crawl order.
    pub products: Vec<Product>,
    /// Ids left untouched because a human owns the existing row.
    pub skipped: Vec<String>,
    /// Firmware attachments created or refreshed.
    pub attachments: usize,
    /// Product ids whose firmware row was not written because an uploaded
    /// attachment already holds that id.
    pub attachment_conflicts: Vec<String>,
}

/// A finished sync plus its background materialization, if one was started.
pub struct SyncRun {
    pub report: SyncReport,
    pub materialization: Option<MaterializeHandle>,
}

pub struct SyncReconciler {
    crawler: WikiTreeCrawler,
    resolver: FirmwareLinkResolver,
    products: Arc<dyn ProductStore>,
    attachments: Arc<AttachmentService>,
    materializer: Option<Materializer>,
    root_page_id: String,
    resolve_concurrency: usize,
}

impl SyncReconciler {
    pub fn new(
        crawler: WikiTreeCrawler,
        resolver: FirmwareLinkResolver,
        products: Arc<dyn ProductStore>,
        attachments: Arc<AttachmentService>,
        root_page_id: &str,
    ) -> Self {
        Self {
            crawler,
            resolver,
            products,
            attachments,
            materializer: None,
            root_page_id: root_page_id.to_string(),
            resolve_concurrency: 16,
        }
    }

    /// Start `materializer` in the background after every successful pass.
    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Upper bound on concurrent firmware resolutions (at least 1).
    pub fn with_resolve_concurrency(mut self, n: usize) -> Self {
        self.resolve_concurrency = n.max(1);
        self
    }

    /// Run the synchronous stages, then kick off materialization.
    pub async fn run(&self) -> Result<SyncRun, SyncError> {
        let report = self.sync().await?;
        let materialization = self.materializer.as_ref().map(Materializer::spawn);
        Ok(SyncRun {
            report,
            materialization,
        })
    }

    /// Crawl, resolve, reconcile and upsert firmware attachments.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let pages = self
            .crawler
            .fetch_products(&self.root_page_id)
            .await
            .map_err(SyncError::Crawl)?;
        info!(pages = pages.len(), "wiki crawl finished");

        // Order preserved; at most `resolve_concurrency` in flight.
        let resolved: Vec<(WikiPage, String, String)> = stream::iter(pages)
            .map(|page| async move {
                let raw = page.firmware.trim().to_string();
                let firmware = self.resolver.resolve(&raw).await?;
                Ok::<_, crate::error::FetchError>((page, raw, firmware))
            })
            .buffered(self.resolve_concurrency)
            .try_collect()
            .await
            .map_err(SyncError::Resolve)?;

        let now = chrono::Utc::now().timestamp();
        let mut raw_firmware = HashMap::with_capacity(resolved.len());
        let rows: Vec<Product> = resolved
            .into_iter()
            .map(|(page, raw, firmware)| {
                let status = if is_upload_url(&firmware) {
                    ProductStatus::Approved
                } else {
                    ProductStatus::Crawler
                };
                raw_firmware.insert(page.id.clone(), raw);
                Product {
                    id: page.id,
                    code: page.title.trim().to_string(),
                    html: page.html.trim().to_string(),
                    firmware,
                    status,
                    created_at: now,
                    updated_at: now,
                }
            })
            .collect();

        let outcome = self
            .products
            .sync_products(&rows)
            .await
            .map_err(SyncError::Reconcile)?;
        for id in &outcome.skipped {
            warn!(page_id = %id, "product is manually owned, left untouched");
        }

        let mut attachments = 0;
        let mut attachment_conflicts = Vec::new();
        for product in &outcome.inserted {
            let raw = raw_firmware
                .get(&product.id)
                .map(String::as_str)
                .unwrap_or(product.firmware.as_str());
            match self
                .attachments
                .upsert_firmware_attachment(product, raw)
                .await
                .map_err(SyncError::Attachment)?
            {
                FirmwareUpsert::Written(_) => attachments += 1,
                FirmwareUpsert::Conflict(_) => attachment_conflicts.push(product.id.clone()),
                FirmwareUpsert::Skipped => {}
            }
        }

        info!(
            products = outcome.inserted.len(),
            skipped = outcome.skipped.len(),
            attachments,
            conflicts = attachment_conflicts.len(),
            "sync finished"
        );
        Ok(SyncReport {
            products: outcome.inserted,
            skipped: outcome.skipped,
            attachments,
            attachment_conflicts,
        })
    }
}
