//! End-to-end sync tests against in-process wiki and tracker fakes.
//!
//! The fakes implement `WikiApi` / `TrackerApi` directly so the crawler's
//! retry and batching behaviour and the reconciler's ordering run exactly
//! as in production, with tokio's paused clock standing in for real
//! timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use product_hub::app::App;
use product_hub::config::{validate, Config};
use product_hub::error::{FetchError, SyncError};
use product_hub::tracker::{RemoteFile, TrackerApi};
use product_hub::wiki::{parse_firmware, WikiApi};
use product_hub_core::hash::{placeholder_hash, sha256_hex};
use product_hub_core::models::{
    FirmwareAttachment, ItemStatus, ItemType, NewAttachment, Product, ProductStatus, WikiPage,
    WikiTreeItem,
};
use product_hub_core::store::memory::InMemoryStore;
use product_hub_core::store::{AttachmentRepo, ProductStore};

const ISSUE_URL: &str = "https://gitlab.example.com/Shelly/fw/shelly-ng/-/issues/3488";
const BUNDLE_URL: &str = "https://gitlab.example.com/-/project/755/uploads/abc123/x.zip";

// ─── Fakes ──────────────────────────────────────────────────────────

fn item(id: &str, status: ItemStatus, item_type: ItemType) -> WikiTreeItem {
    WikiTreeItem {
        id: id.to_string(),
        title: format!("item {}", id),
        status,
        item_type,
    }
}

fn firmware_table(cell: &str) -> String {
    format!(
        "<h1>Spec</h1><table><tbody><tr><th>Model</th><td>X</td></tr>\
         <tr><th>Firmware</th><td>{}</td></tr></tbody></table>",
        cell
    )
}

#[derive(Default)]
struct FakeWiki {
    page_children: HashMap<String, Vec<WikiTreeItem>>,
    folder_children: HashMap<String, Vec<WikiTreeItem>>,
    pages: HashMap<String, (String, String)>,
    stalled_folders: HashSet<String>,
    failing_pages: HashSet<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    page_calls: AtomicUsize,
}

impl FakeWiki {
    fn page(&mut self, id: &str, title: &str, html: String) {
        self.pages.insert(id.to_string(), (title.to_string(), html));
    }
}

#[async_trait]
impl WikiApi for FakeWiki {
    async fn children_of_page(&self, page_id: &str) -> Result<Vec<WikiTreeItem>, FetchError> {
        Ok(self.page_children.get(page_id).cloned().unwrap_or_default())
    }

    async fn children_of_folder(&self, folder_id: &str) -> Result<Vec<WikiTreeItem>, FetchError> {
        if self.stalled_folders.contains(folder_id) {
            std::future::pending::<()>().await;
        }
        Ok(self.folder_children.get(folder_id).cloned().unwrap_or_default())
    }

    async fn page_by_id(&self, page_id: &str) -> Result<WikiPage, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_pages.contains(page_id) {
            return Err(FetchError::Status {
                target: format!("page {}", page_id),
                status: 500,
                body: "internal error".into(),
            });
        }
        let (title, html) = self.pages.get(page_id).cloned().ok_or_else(|| FetchError::Status {
            target: format!("page {}", page_id),
            status: 404,
            body: String::new(),
        })?;
        Ok(WikiPage {
            id: page_id.to_string(),
            title,
            firmware: parse_firmware(&html),
            html,
            status: ItemStatus::Current,
        })
    }
}

struct FakeTracker {
    description: Option<String>,
    file: Vec<u8>,
    downloads: AtomicUsize,
}

impl FakeTracker {
    fn with_bundle() -> Self {
        Self {
            description: Some(
                "Release notes\n\nProduction bundle: **[x.zip](/uploads/abc123/x.zip)**\n".into(),
            ),
            file: b"PK\x03\x04 firmware bundle".to_vec(),
            downloads: AtomicUsize::new(0),
        }
    }

    fn unavailable() -> Self {
        Self {
            description: None,
            ..Self::with_bundle()
        }
    }
}

#[async_trait]
impl TrackerApi for FakeTracker {
    async fn issue_description(&self, _project_id: &str, iid: u64) -> Result<String, FetchError> {
        self.description.clone().ok_or_else(|| FetchError::Status {
            target: format!("issue {}", iid),
            status: 503,
            body: "maintenance".into(),
        })
    }

    async fn download_upload(&self, url: &str) -> Result<RemoteFile, FetchError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteFile {
            filename: url.rsplit('/').next().unwrap_or_default().to_string(),
            sha256: sha256_hex(&self.file),
            mimetype: "application/zip".into(),
            size: self.file.len() as i64,
            bytes: self.file.clone(),
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn test_config(tmp: &TempDir, strict: bool) -> Config {
    let config_content = format!(
        r#"
[db]
path = "{db}"

[storage]
root = "{root}"

[wiki]
base_url = "https://wiki.example.com"
user_email = "bot@example.com"
root_page_id = "1"

[tracker]
base_url = "https://gitlab.example.com"
project_path = "Shelly/fw/shelly-ng"
project_id = "755"
strict = {strict}

[server]
bind = "127.0.0.1:0"
"#,
        db = tmp.path().join("phub.sqlite").display(),
        root = tmp.path().join("uploads").display(),
        strict = strict,
    );
    validate(toml::from_str(&config_content).unwrap()).unwrap()
}

/// Root `1` holds a current folder `10`, an archived folder `11` and a
/// stray page `12`. Folder `10` holds page `100`, trashed page `101` and
/// subfolder `20` with page `200`.
fn catalogue() -> FakeWiki {
    let mut wiki = FakeWiki::default();
    wiki.page_children.insert(
        "1".into(),
        vec![
            item("10", ItemStatus::Current, ItemType::Folder),
            item("11", ItemStatus::Archived, ItemType::Folder),
            item("12", ItemStatus::Current, ItemType::Page),
        ],
    );
    wiki.folder_children.insert(
        "10".into(),
        vec![
            item("100", ItemStatus::Current, ItemType::Page),
            item("101", ItemStatus::Trashed, ItemType::Page),
            item("20", ItemStatus::Current, ItemType::Folder),
        ],
    );
    wiki.folder_children.insert(
        "11".into(),
        vec![item("110", ItemStatus::Current, ItemType::Page)],
    );
    wiki.folder_children.insert(
        "20".into(),
        vec![item("200", ItemStatus::Current, ItemType::Page)],
    );
    wiki.page(
        "100",
        "  Widget-A  ",
        firmware_table(&format!(r#"<a href="{}">#3488</a>"#, ISSUE_URL)),
    );
    wiki.page("200", "Gadget", firmware_table("  1.2.3  "));
    wiki
}

struct Harness {
    _tmp: TempDir,
    store: Arc<InMemoryStore>,
    wiki: Arc<FakeWiki>,
    tracker: Arc<FakeTracker>,
    app: App,
}

fn harness(wiki: FakeWiki, tracker: FakeTracker, strict: bool) -> Harness {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, strict);
    let store = Arc::new(InMemoryStore::new());
    let wiki = Arc::new(wiki);
    let tracker = Arc::new(tracker);
    let app = App::assemble(
        &cfg,
        store.clone(),
        store.clone(),
        wiki.clone(),
        tracker.clone(),
    );
    Harness {
        _tmp: tmp,
        store,
        wiki,
        tracker,
        app,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_sync_builds_products_and_firmware_attachment() {
    let h = harness(catalogue(), FakeTracker::with_bundle(), false);

    let report = h.app.reconciler.sync().await.unwrap();

    let ids: Vec<&str> = report.products.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["100", "200"]);
    assert!(report.skipped.is_empty());
    assert_eq!(report.attachments, 1);

    let widget = h.store.get_product("100").await.unwrap().unwrap();
    assert_eq!(widget.code, "Widget-A");
    assert_eq!(widget.firmware, BUNDLE_URL);
    assert_eq!(widget.status, ProductStatus::Approved);
    assert!(widget.html.starts_with("<h1>"));

    let gadget = h.store.get_product("200").await.unwrap().unwrap();
    assert_eq!(gadget.firmware, "1.2.3");
    assert_eq!(gadget.status, ProductStatus::Crawler);

    assert!(h.store.get_product("12").await.unwrap().is_none());
    assert!(h.store.get_product("101").await.unwrap().is_none());
    assert!(h.store.get_product("110").await.unwrap().is_none());

    let attachments = h.store.all_attachments();
    assert_eq!(attachments.len(), 1);
    let fw = &attachments[0];
    assert_eq!(fw.id, 100);
    assert_eq!(fw.hash, placeholder_hash(ISSUE_URL));
    assert_eq!(fw.remark, BUNDLE_URL);
    assert_eq!(fw.name, "x.zip");
    assert_eq!(fw.tag, "firmware");
    assert_eq!(fw.status, "approved");
    assert_eq!(fw.product_code, "Widget-A");
    assert_eq!(fw.size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_uploaded_row_on_page_id_is_reported_not_overwritten() {
    let h = harness(catalogue(), FakeTracker::with_bundle(), false);
    // A firmware row at 99 pushes the next serial id to 100, the id of
    // the Widget-A page.
    h.store
        .upsert_firmware_attachment(&FirmwareAttachment {
            id: 99,
            hash: placeholder_hash("earlier"),
            name: "old.zip".into(),
            product_code: "Old".into(),
            remark: BUNDLE_URL.into(),
            status: "approved".into(),
            tag: "firmware".into(),
        })
        .await
        .unwrap();
    let manual = h
        .store
        .insert_attachment(&NewAttachment {
            hash: sha256_hex(b"manual"),
            name: "manual.pdf".into(),
            tag: "manual".into(),
            product_code: "Plug-S".into(),
            status: "draft".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(manual.id, 100);

    let report = h.app.reconciler.sync().await.unwrap();

    assert_eq!(report.attachments, 0);
    assert_eq!(report.attachment_conflicts, vec!["100".to_string()]);
    assert_eq!(h.store.get_attachment(100).await.unwrap().unwrap(), manual);
    // The product itself is still synced.
    assert_eq!(
        h.store.get_product("100").await.unwrap().unwrap().status,
        ProductStatus::Approved
    );
}

#[tokio::test(start_paused = true)]
async fn test_resync_keeps_placeholder_stable() {
    let h = harness(catalogue(), FakeTracker::with_bundle(), false);
    h.app.reconciler.sync().await.unwrap();
    h.store.increment_download_count(100).await.unwrap();
    h.app.reconciler.sync().await.unwrap();

    let attachments = h.store.all_attachments();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].hash, placeholder_hash(ISSUE_URL));
    assert_eq!(attachments[0].download_count, 1);
}

#[tokio::test]
async fn test_run_materializes_in_background() {
    let h = harness(catalogue(), FakeTracker::with_bundle(), false);

    let run = h.app.reconciler.run().await.unwrap();
    assert_eq!(run.report.products.len(), 2);
    let report = run.materialization.expect("materializer configured").wait().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.materialized, 1);
    assert_eq!(report.failed, 0);

    let real_hash = sha256_hex(&h.tracker.file);
    let blobs = h.app.attachments.blobs();
    assert!(blobs.exists(&real_hash).await.unwrap());

    // The row keeps its placeholder, so the next download fetches again.
    let row = h.store.get_attachment(100).await.unwrap().unwrap();
    assert!(row.is_placeholder());
    assert_eq!(row.download_count, 1);

    let download = h.app.attachments.download(&row.hash).await.unwrap();
    assert_eq!(download.bytes, h.tracker.file);
    assert_eq!(download.attachment.hash, real_hash);
    assert_eq!(download.filename(), "100.x.zip");
    assert_eq!(download.content_type(), "application/zip");
    assert_eq!(h.tracker.downloads.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.store.get_attachment(100).await.unwrap().unwrap().download_count,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_manually_owned_rows_are_skipped() {
    let h = harness(catalogue(), FakeTracker::with_bundle(), false);
    h.store.put_product(Product {
        id: "100".into(),
        code: "Widget-A (manual)".into(),
        html: String::new(),
        firmware: "hand-picked".into(),
        status: ProductStatus::Edited,
        created_at: 1,
        updated_at: 1,
    });
    h.store.put_product(Product {
        id: "999".into(),
        code: "Legacy".into(),
        html: String::new(),
        firmware: String::new(),
        status: ProductStatus::Crawler,
        created_at: 1,
        updated_at: 1,
    });

    let report = h.app.reconciler.sync().await.unwrap();

    assert_eq!(report.skipped, vec!["100".to_string()]);
    assert_eq!(report.products.len(), 1);
    assert_eq!(report.attachments, 0);
    let kept = h.store.get_product("100").await.unwrap().unwrap();
    assert_eq!(kept.firmware, "hand-picked");
    assert_eq!(kept.status, ProductStatus::Edited);
    // Rows outside the crawl are untouched.
    assert!(h.store.get_product("999").await.unwrap().is_some());
    assert!(h.store.all_attachments().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lenient_resolver_keeps_raw_link() {
    let h = harness(catalogue(), FakeTracker::unavailable(), false);

    let report = h.app.reconciler.sync().await.unwrap();

    let widget = report.products.iter().find(|p| p.id == "100").unwrap();
    assert_eq!(widget.firmware, ISSUE_URL);
    assert_eq!(widget.status, ProductStatus::Crawler);
    assert_eq!(report.attachments, 0);
}

#[tokio::test(start_paused = true)]
async fn test_strict_resolver_fails_sync() {
    let h = harness(catalogue(), FakeTracker::unavailable(), true);

    let err = h.app.reconciler.sync().await.unwrap_err();

    assert_eq!(err.stage(), "resolve");
    assert!(matches!(
        err,
        SyncError::Resolve(FetchError::Status { status: 503, .. })
    ));
    assert!(h.store.all_products().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_page_error_aborts_whole_crawl() {
    let mut wiki = catalogue();
    wiki.failing_pages.insert("200".into());
    let h = harness(wiki, FakeTracker::with_bundle(), false);

    let err = h.app.reconciler.sync().await.unwrap_err();

    assert_eq!(err.stage(), "crawl");
    assert!(err.to_string().contains("page 200"));
    assert!(h.store.all_products().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_folder_exhausts_retries() {
    let mut wiki = catalogue();
    wiki.stalled_folders.insert("20".into());
    let h = harness(wiki, FakeTracker::with_bundle(), false);

    let err = h.app.reconciler.sync().await.unwrap_err();

    match err {
        SyncError::Crawl(FetchError::RetriesExhausted { target, attempts }) => {
            assert_eq!(target, "folder 20");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.wiki.page_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_page_fetches_bounded_to_batch_size() {
    let mut wiki = FakeWiki::default();
    wiki.page_children.insert(
        "1".into(),
        vec![item("10", ItemStatus::Current, ItemType::Folder)],
    );
    let pages: Vec<WikiTreeItem> = (0..12)
        .map(|i| item(&format!("{}", 500 + i), ItemStatus::Current, ItemType::Page))
        .collect();
    for p in &pages {
        wiki.page(&p.id, &format!("P{}", p.id), firmware_table("none"));
    }
    wiki.folder_children.insert("10".into(), pages);
    let h = harness(wiki, FakeTracker::with_bundle(), false);

    let report = h.app.reconciler.sync().await.unwrap();

    assert_eq!(report.products.len(), 12);
    assert_eq!(h.wiki.page_calls.load(Ordering::SeqCst), 12);
    assert_eq!(h.wiki.max_in_flight.load(Ordering::SeqCst), 5);
    let ids: Vec<String> = report.products.iter().map(|p| p.id.clone()).collect();
    let expected: Vec<String> = (0..12).map(|i| format!("{}", 500 + i)).collect();
    assert_eq!(ids, expected);
}
