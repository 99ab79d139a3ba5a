//! Background materialization of remote-backed attachments.
//!
//! After a sync, every attachment still carrying a `URL:` placeholder hash
//! is downloaded once through [`AttachmentService::download`] so its bytes
//! land in local blob storage. Items run concurrently, each under its own
//! timeout; a failure is logged and never affects its siblings or the
//! caller.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use product_hub_core::models::AttachmentQuery;
use product_hub_core::store::AttachmentRepo;

use crate::attachments::{AttachmentService, MAX_PAGE_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub attempted: usize,
    pub materialized: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Materializer {
    repo: Arc<dyn AttachmentRepo>,
    service: Arc<AttachmentService>,
    timeout: Duration,
}

impl Materializer {
    pub fn new(
        repo: Arc<dyn AttachmentRepo>,
        service: Arc<AttachmentService>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            service,
            timeout,
        }
    }

    /// Distinct placeholder hashes across the full attachment listing.
    pub async fn pending(&self) -> anyhow::Result<Vec<String>> {
        let mut hashes = BTreeSet::new();
        let mut query = AttachmentQuery {
            limit: MAX_PAGE_SIZE,
            ..Default::default()
        };
        loop {
            let page = self.repo.list_attachments(&query).await?;
            let fetched = page.rows.len() as i64;
            hashes.extend(
                page.rows
                    .into_iter()
                    .filter(|a| a.is_placeholder())
                    .map(|a| a.hash),
            );
            if fetched < query.limit || query.offset() + fetched >= page.total {
                break;
            }
            query.page += 1;
        }
        Ok(hashes.into_iter().collect())
    }

    /// Materialize every pending attachment. Never fails; problems are logged.
    pub async fn run(&self) -> MaterializeReport {
        let hashes = match self.pending().await {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "could not list attachments for materialization");
                return MaterializeReport::default();
            }
        };

        let mut report = MaterializeReport {
            attempted: hashes.len(),
            ..Default::default()
        };
        if hashes.is_empty() {
            return report;
        }
        info!(pending = hashes.len(), "materializing remote attachments");

        let mut tasks = JoinSet::new();
        for hash in hashes {
            let service = self.service.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let outcome = tokio::time::timeout(timeout, service.download(&hash)).await;
                (hash, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((hash, Ok(Ok(download)))) => {
                    report.materialized += 1;
                    info!(
                        hash = %hash,
                        attachment_id = download.attachment.id,
                        size = download.content_length(),
                        "attachment materialized"
                    );
                }
                Ok((hash, Ok(Err(e)))) => {
                    report.failed += 1;
                    warn!(hash = %hash, error = %e, "materialization failed");
                }
                Ok((hash, Err(_))) => {
                    report.failed += 1;
                    warn!(hash = %hash, timeout_secs = self.timeout.as_secs(), "materialization timed out");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "materialization task panicked");
                }
            }
        }

        info!(
            materialized = report.materialized,
            failed = report.failed,
            "materialization finished"
        );
        report
    }

    /// Run in the background. The returned handle may be awaited or dropped.
    pub fn spawn(&self) -> MaterializeHandle {
        let this = self.clone();
        MaterializeHandle(tokio::spawn(async move { this.run().await }))
    }
}

/// Handle to a background materialization pass.
pub struct MaterializeHandle(JoinHandle<MaterializeReport>);

impl MaterializeHandle {
    pub async fn wait(self) -> MaterializeReport {
        match self.0.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "materialization task failed");
                MaterializeReport::default()
            }
        }
    }
}
