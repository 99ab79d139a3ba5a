//! Wiring of stores, connectors and services from a [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use product_hub_core::store::{AttachmentRepo, ProductStore};

use crate::attachments::AttachmentService;
use crate::blobs::BlobStore;
use crate::config::Config;
use crate::materialize::Materializer;
use crate::sqlite_store::SqliteStore;
use crate::sync::SyncReconciler;
use crate::tracker::{FirmwareLinkResolver, TrackerApi, TrackerClient};
use crate::wiki::{WikiApi, WikiClient, WikiTreeCrawler};

/// Everything a command or request handler needs.
pub struct App {
    pub config: Arc<Config>,
    pub products: Arc<dyn ProductStore>,
    pub attachments: Arc<AttachmentService>,
    pub materializer: Materializer,
    pub reconciler: SyncReconciler,
}

impl App {
    /// Open the configured database and build the real HTTP clients.
    ///
    /// Fails when `WIKI_API_TOKEN` or `TRACKER_TOKEN` is unset.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(config).await?);
        let wiki: Arc<dyn WikiApi> = Arc::new(WikiClient::from_config(&config.wiki)?);
        let tracker: Arc<dyn TrackerApi> = Arc::new(TrackerClient::from_config(&config.tracker)?);
        Ok(Self::assemble(config, store.clone(), store, wiki, tracker))
    }

    /// Attachment service alone, for commands that never touch the wiki.
    ///
    /// Needs `TRACKER_TOKEN` but not `WIKI_API_TOKEN`.
    pub async fn attachment_service(config: &Config) -> Result<AttachmentService> {
        let store = Arc::new(SqliteStore::open(config).await?);
        let tracker: Arc<dyn TrackerApi> = Arc::new(TrackerClient::from_config(&config.tracker)?);
        Ok(AttachmentService::new(
            store,
            BlobStore::new(config.storage.resolved_root()),
            tracker,
            config.tracker.layout(),
        ))
    }

    /// Build from explicit collaborators.
    pub fn assemble(
        config: &Config,
        products: Arc<dyn ProductStore>,
        repo: Arc<dyn AttachmentRepo>,
        wiki: Arc<dyn WikiApi>,
        tracker: Arc<dyn TrackerApi>,
    ) -> Self {
        let config = Arc::new(config.clone());
        let blobs = BlobStore::new(config.storage.resolved_root());

        let attachments = Arc::new(AttachmentService::new(
            repo.clone(),
            blobs,
            tracker.clone(),
            config.tracker.layout(),
        ));
        let materializer = Materializer::new(
            repo,
            attachments.clone(),
            Duration::from_secs(config.sync.materialize_timeout_secs),
        );
        let reconciler = SyncReconciler::new(
            WikiTreeCrawler::from_config(wiki, &config.wiki),
            FirmwareLinkResolver::from_config(tracker, &config.tracker),
            products.clone(),
            attachments.clone(),
            &config.wiki.root_page_id,
        )
        .with_resolve_concurrency(config.sync.resolve_concurrency)
        .with_materializer(materializer.clone());

        Self {
            config,
            products,
            attachments,
            materializer,
            reconciler,
        }
    }
}
