//! Attachment service: uploads, firmware rows, downloads and metadata edits.
//!
//! Bytes go to the [`BlobStore`] under their sha256; rows go to an
//! [`AttachmentRepo`]. Firmware attachments created by sync start out with
//! a `URL:` placeholder hash and are fetched from the tracker on first
//! download.
//!
//! The placeholder hash is never rewritten in the row after a remote
//! fetch. The stored blob lands under the real hash, but lookups keep
//! going through the placeholder, so every download of such a row fetches
//! from the tracker again.

use std::sync::Arc;

use tracing::{info, warn};

use product_hub_core::firmware::{file_name, is_upload_url, TrackerLayout};
use product_hub_core::hash::{is_content_hash, placeholder_hash, sha256_hex};
use product_hub_core::models::{
    Attachment, AttachmentQuery, AttachmentUpdate, Comment, CommentAction, FirmwareAttachment,
    NewAttachment, Paged, Product, ATTACHMENT_STATUSES, ATTACHMENT_TAGS, STATUS_APPROVED,
    STATUS_DELETED, STATUS_DRAFT, TAG_FIRMWARE,
};
use product_hub_core::store::AttachmentRepo;

use crate::blobs::BlobStore;
use crate::error::{AttachmentError, DownloadError};
use crate::tracker::TrackerApi;

/// Author recorded on history entries when no email is supplied.
pub const SYSTEM_AUTHOR: &str = "system";

/// Largest page size accepted by [`AttachmentService::list`].
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub name: String,
    pub mimetype: String,
    pub tag: String,
    pub remark: String,
    pub product_code: String,
    /// Uploader; `system` when empty.
    pub email: String,
}

/// A served download.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    /// Row metadata; for remote fetches this carries the fetched file's
    /// real hash, size, mimetype and name.
    pub attachment: Attachment,
}

impl Download {
    /// Suggested file name, `"{id}.{name}"`.
    pub fn filename(&self) -> String {
        format!("{}.{}", self.attachment.id, self.attachment.name)
    }

    pub fn content_type(&self) -> &str {
        if self.attachment.mimetype.is_empty() {
            "application/octet-stream"
        } else {
            &self.attachment.mimetype
        }
    }

    /// Length of the served bytes; always equal to `attachment.size`.
    pub fn content_length(&self) -> usize {
        self.bytes.len()
    }
}

/// Result of writing a synced product's firmware attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareUpsert {
    Written(Attachment),
    /// Firmware is not an upload URL, or the product id is not numeric.
    Skipped,
    /// The id belongs to an attachment the sync does not own.
    Conflict(i64),
}

impl FirmwareUpsert {
    pub fn attachment(self) -> Option<Attachment> {
        match self {
            FirmwareUpsert::Written(attachment) => Some(attachment),
            _ => None,
        }
    }
}

pub struct AttachmentService {
    repo: Arc<dyn AttachmentRepo>,
    blobs: BlobStore,
    tracker: Arc<dyn TrackerApi>,
    layout: TrackerLayout,
}

fn author(email: &str) -> &str {
    if email.trim().is_empty() {
        SYSTEM_AUTHOR
    } else {
        email
    }
}

fn check_tag(tag: &str) -> Result<(), AttachmentError> {
    if ATTACHMENT_TAGS.contains(&tag) {
        Ok(())
    } else {
        Err(AttachmentError::Invalid(format!(
            "tag '{}': expected one of {}",
            tag,
            ATTACHMENT_TAGS.join(", ")
        )))
    }
}

fn check_status(status: &str) -> Result<(), AttachmentError> {
    if ATTACHMENT_STATUSES.contains(&status) {
        Ok(())
    } else {
        Err(AttachmentError::Invalid(format!(
            "status '{}': expected one of {}",
            status,
            ATTACHMENT_STATUSES.join(", ")
        )))
    }
}

impl AttachmentService {
    pub fn new(
        repo: Arc<dyn AttachmentRepo>,
        blobs: BlobStore,
        tracker: Arc<dyn TrackerApi>,
        layout: TrackerLayout,
    ) -> Self {
        Self {
            repo,
            blobs,
            tracker,
            layout,
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Store `bytes` under their sha256 and insert a `draft` row for them.
    ///
    /// No dedup check is made against existing rows: uploading the same
    /// bytes twice yields two rows sharing one blob.
    pub async fn upload(&self, bytes: &[u8], meta: UploadMeta) -> Result<Attachment, AttachmentError> {
        check_tag(&meta.tag)?;
        if meta.name.trim().is_empty() {
            return Err(AttachmentError::Invalid("name: must not be empty".into()));
        }

        let hash = sha256_hex(bytes);
        self.blobs.write(&hash, bytes).await?;

        let row = NewAttachment {
            hash,
            name: meta.name,
            size: bytes.len() as i64,
            mimetype: if meta.mimetype.is_empty() {
                "application/octet-stream".to_string()
            } else {
                meta.mimetype
            },
            status: STATUS_DRAFT.to_string(),
            remark: meta.remark,
            tag: meta.tag,
            product_code: meta.product_code,
            comments: vec![Comment::now(
                author(&meta.email),
                "uploaded",
                CommentAction::Created,
            )],
        };
        let attachment = self.repo.insert_attachment(&row).await?;
        info!(attachment_id = attachment.id, hash = %attachment.hash, size = attachment.size, "attachment uploaded");
        Ok(attachment)
    }

    /// Create or refresh the firmware attachment of a synced product.
    ///
    /// `raw_firmware` is the firmware value before resolution; the
    /// placeholder hash is derived from it so that it stays stable across
    /// syncs.
    pub async fn upsert_firmware_attachment(
        &self,
        product: &Product,
        raw_firmware: &str,
    ) -> anyhow::Result<FirmwareUpsert> {
        if !is_upload_url(&product.firmware) {
            return Ok(FirmwareUpsert::Skipped);
        }
        let id: i64 = match product.id.parse() {
            Ok(id) if id > 0 => id,
            _ => {
                warn!(page_id = %product.id, "non-numeric product id, skipping firmware attachment");
                return Ok(FirmwareUpsert::Skipped);
            }
        };

        let row = FirmwareAttachment {
            id,
            hash: placeholder_hash(raw_firmware),
            name: file_name(&product.firmware),
            product_code: product.code.clone(),
            remark: product.firmware.clone(),
            status: STATUS_APPROVED.to_string(),
            tag: TAG_FIRMWARE.to_string(),
        };
        match self.repo.upsert_firmware_attachment(&row).await? {
            Some(attachment) => Ok(FirmwareUpsert::Written(attachment)),
            None => {
                warn!(
                    attachment_id = id,
                    product_code = %product.code,
                    "attachment id already held by a non-firmware row, left untouched"
                );
                Ok(FirmwareUpsert::Conflict(id))
            }
        }
    }

    /// Serve the attachment stored under `hash`.
    ///
    /// Placeholder rows whose remark is an upload URL of the configured
    /// tracker are fetched remotely and cached under the real hash; all
    /// other rows are read from the blob store. The download counter is
    /// bumped on success.
    pub async fn download(&self, hash: &str) -> Result<Download, DownloadError> {
        let row = self
            .repo
            .find_attachment_by_hash(hash)
            .await
            .map_err(DownloadError::Storage)?
            .ok_or_else(|| DownloadError::RecordNotFound(hash.to_string()))?;

        let mut download = if row.is_placeholder() && self.layout.is_tracker_upload(&row.remark) {
            let remote = self
                .tracker
                .download_upload(&row.remark)
                .await
                .map_err(|source| DownloadError::RemoteFetch { id: row.id, source })?;
            self.blobs
                .write(&remote.sha256, &remote.bytes)
                .await
                .map_err(DownloadError::Storage)?;
            let size = remote.bytes.len() as i64;
            if remote.size != size {
                warn!(
                    attachment_id = row.id,
                    declared = remote.size,
                    received = size,
                    "remote Content-Length does not match body"
                );
            }
            info!(attachment_id = row.id, hash = %remote.sha256, size, "materialized remote attachment");

            let attachment = Attachment {
                hash: remote.sha256,
                size,
                mimetype: remote.mimetype,
                name: remote.filename,
                ..row
            };
            Download {
                bytes: remote.bytes,
                attachment,
            }
        } else {
            if !is_content_hash(&row.hash) {
                return Err(DownloadError::BlobNotFound(row.hash));
            }
            let bytes = self
                .blobs
                .read(&row.hash)
                .await
                .map_err(DownloadError::Storage)?
                .ok_or_else(|| DownloadError::BlobNotFound(row.hash.clone()))?;
            Download {
                bytes,
                attachment: row,
            }
        };

        let id = download.attachment.id;
        if let Err(e) = self.repo.increment_download_count(id).await {
            warn!(attachment_id = id, error = %e, "failed to bump download count");
        }
        download.attachment.download_count += 1;
        Ok(download)
    }

    pub async fn get(&self, id: i64) -> Result<Attachment, AttachmentError> {
        self.repo
            .get_attachment(id)
            .await?
            .ok_or(AttachmentError::NotFound(id))
    }

    pub async fn list(&self, query: &AttachmentQuery) -> Result<Paged<Attachment>, AttachmentError> {
        if query.page < 1 {
            return Err(AttachmentError::Invalid("page: must be >= 1".into()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&query.limit) {
            return Err(AttachmentError::Invalid(format!(
                "limit: must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(self.repo.list_attachments(query).await?)
    }

    /// Validate and apply a metadata edit, recording an `updated` entry.
    pub async fn update(
        &self,
        id: i64,
        update: &AttachmentUpdate,
        email: &str,
    ) -> Result<Attachment, AttachmentError> {
        if update.is_empty() {
            return Err(AttachmentError::Invalid("update: no fields given".into()));
        }
        if let Some(tag) = &update.tag {
            check_tag(tag)?;
        }
        if let Some(status) = &update.status {
            check_status(status)?;
        }
        if let Some(count) = update.download_count {
            if count < 0 {
                return Err(AttachmentError::Invalid(
                    "download_count: must be >= 0".into(),
                ));
            }
        }

        let comment = Comment::now(author(email), &changed_fields(update), CommentAction::Updated);
        self.repo
            .update_attachment(id, update, Some(comment))
            .await?
            .ok_or(AttachmentError::NotFound(id))
    }

    /// Mark the attachment `deleted`. The row and its blob are kept.
    pub async fn soft_delete(&self, id: i64, email: &str) -> Result<Attachment, AttachmentError> {
        let update = AttachmentUpdate {
            status: Some(STATUS_DELETED.to_string()),
            ..Default::default()
        };
        let comment = Comment::now(author(email), "deleted", CommentAction::Deleted);
        let attachment = self
            .repo
            .update_attachment(id, &update, Some(comment))
            .await?
            .ok_or(AttachmentError::NotFound(id))?;
        info!(attachment_id = id, "attachment soft-deleted");
        Ok(attachment)
    }
}

fn changed_fields(update: &AttachmentUpdate) -> String {
    let mut fields = Vec::new();
    if update.name.is_some() {
        fields.push("name");
    }
    if update.remark.is_some() {
        fields.push("remark");
    }
    if update.tag.is_some() {
        fields.push("tag");
    }
    if update.status.is_some() {
        fields.push("status");
    }
    if update.download_count.is_some() {
        fields.push("download_count");
    }
    if update.product_code.is_some() {
        fields.push("product_code");
    }
    format!("updated {}", fields.join(", "))
}
