//! In-memory [`ProductStore`] / [`AttachmentRepo`] for tests.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Semantics follow
//! the SQLite backend, including the skip-and-report policy for
//! human-owned product rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Attachment, AttachmentQuery, AttachmentUpdate, Comment, FirmwareAttachment, NewAttachment,
    Paged, Product,
};

use super::{attachment_matches, fast_view, AttachmentRepo, ProductStore, ProductSyncOutcome};

struct AttachmentTable {
    rows: BTreeMap<i64, Attachment>,
    next_id: i64,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    products: RwLock<HashMap<String, Product>>,
    attachments: RwLock<AttachmentTable>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            products: RwLock::new(HashMap::new()),
            attachments: RwLock::new(AttachmentTable {
                rows: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Seed a product row directly, bypassing sync rules.
    pub fn put_product(&self, product: Product) {
        self.products
            .write()
            .unwrap()
            .insert(product.id.clone(), product);
    }

    pub fn all_products(&self) -> Vec<Product> {
        let mut rows: Vec<Product> = self.products.read().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn all_attachments(&self) -> Vec<Attachment> {
        self.attachments
            .read()
            .unwrap()
            .rows
            .values()
            .cloned()
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl ProductStore for InMemoryStore {
    async fn sync_products(&self, rows: &[Product]) -> Result<ProductSyncOutcome> {
        let mut products = self.products.write().unwrap();
        let mut outcome = ProductSyncOutcome::default();
        for row in rows {
            match products.get(&row.id) {
                Some(existing) if !existing.status.is_sync_owned() => {
                    outcome.skipped.push(row.id.clone());
                }
                _ => {
                    products.insert(row.id.clone(), row.clone());
                    outcome.inserted.push(row.clone());
                }
            }
        }
        Ok(outcome)
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>> {
        Ok(self.products.read().unwrap().get(id).cloned())
    }

    async fn list_products(&self, search: &str, page: i64, limit: i64) -> Result<Paged<Product>> {
        let needle = search.to_lowercase();
        let mut rows: Vec<Product> = self
            .products
            .read()
            .unwrap()
            .values()
            .filter(|p| needle.is_empty() || p.code.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.status.as_str().cmp(b.status.as_str()).then(a.id.cmp(&b.id)));
        let total = rows.len() as i64;
        let offset = ((page.max(1) - 1) * limit.max(0)) as usize;
        let rows = rows.into_iter().skip(offset).take(limit.max(0) as usize).collect();
        Ok(Paged {
            page,
            limit,
            total,
            rows,
        })
    }
}

#[async_trait]
impl AttachmentRepo for InMemoryStore {
    async fn insert_attachment(&self, row: &NewAttachment) -> Result<Attachment> {
        let mut table = self.attachments.write().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        let ts = now();
        let attachment = Attachment {
            id,
            hash: row.hash.clone(),
            name: row.name.clone(),
            size: row.size,
            mimetype: row.mimetype.clone(),
            status: row.status.clone(),
            download_count: 0,
            remark: row.remark.clone(),
            tag: row.tag.clone(),
            product_code: row.product_code.clone(),
            comments: row.comments.clone(),
            created_at: ts,
            updated_at: ts,
        };
        table.rows.insert(id, attachment.clone());
        Ok(attachment)
    }

    async fn upsert_firmware_attachment(
        &self,
        row: &FirmwareAttachment,
    ) -> Result<Option<Attachment>> {
        let mut table = self.attachments.write().unwrap();
        let ts = now();
        let attachment = match table.rows.get(&row.id) {
            Some(existing) if !existing.is_sync_firmware() => return Ok(None),
            Some(existing) => Attachment {
                hash: row.hash.clone(),
                name: row.name.clone(),
                product_code: row.product_code.clone(),
                remark: row.remark.clone(),
                status: row.status.clone(),
                tag: row.tag.clone(),
                updated_at: ts,
                ..existing.clone()
            },
            None => Attachment {
                id: row.id,
                hash: row.hash.clone(),
                name: row.name.clone(),
                size: 0,
                mimetype: String::new(),
                status: row.status.clone(),
                download_count: 0,
                remark: row.remark.clone(),
                tag: row.tag.clone(),
                product_code: row.product_code.clone(),
                comments: Vec::new(),
                created_at: ts,
                updated_at: ts,
            },
        };
        table.rows.insert(row.id, attachment.clone());
        table.next_id = table.next_id.max(row.id + 1);
        Ok(Some(attachment))
    }

    async fn get_attachment(&self, id: i64) -> Result<Option<Attachment>> {
        Ok(self.attachments.read().unwrap().rows.get(&id).cloned())
    }

    async fn find_attachment_by_hash(&self, hash: &str) -> Result<Option<Attachment>> {
        Ok(self
            .attachments
            .read()
            .unwrap()
            .rows
            .values()
            .find(|a| a.hash == hash)
            .cloned())
    }

    async fn list_attachments(&self, query: &AttachmentQuery) -> Result<Paged<Attachment>> {
        let table = self.attachments.read().unwrap();
        let mut rows: Vec<&Attachment> = table
            .rows
            .values()
            .filter(|a| attachment_matches(a, query))
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        let rows = rows
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit.max(0) as usize)
            .map(|a| if query.fast { fast_view(a) } else { a.clone() })
            .collect();
        Ok(Paged {
            page: query.page,
            limit: query.limit,
            total,
            rows,
        })
    }

    async fn update_attachment(
        &self,
        id: i64,
        update: &AttachmentUpdate,
        comment: Option<Comment>,
    ) -> Result<Option<Attachment>> {
        let mut table = self.attachments.write().unwrap();
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(ref v) = update.name {
            row.name = v.clone();
        }
        if let Some(ref v) = update.remark {
            row.remark = v.clone();
        }
        if let Some(ref v) = update.tag {
            row.tag = v.clone();
        }
        if let Some(ref v) = update.status {
            row.status = v.clone();
        }
        if let Some(v) = update.download_count {
            row.download_count = v;
        }
        if let Some(ref v) = update.product_code {
            row.product_code = v.clone();
        }
        if let Some(c) = comment {
            row.comments.push(c);
        }
        row.updated_at = now();
        Ok(Some(row.clone()))
    }

    async fn increment_download_count(&self, id: i64) -> Result<()> {
        if let Some(row) = self.attachments.write().unwrap().rows.get_mut(&id) {
            row.download_count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductStatus;

    fn product(id: &str, status: ProductStatus) -> Product {
        Product {
            id: id.to_string(),
            code: format!("P-{}", id),
            html: String::new(),
            firmware: String::new(),
            status,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_sync_replaces_owned_and_skips_protected() {
        let store = InMemoryStore::new();
        store.put_product(product("1", ProductStatus::Approved));
        store.put_product(product("2", ProductStatus::Edited));
        store.put_product(product("3", ProductStatus::Rejected));

        let mut fresh1 = product("1", ProductStatus::Crawler);
        fresh1.code = "fresh".into();
        let outcome = store
            .sync_products(&[fresh1, product("2", ProductStatus::Crawler)])
            .await
            .unwrap();

        assert_eq!(outcome.inserted.len(), 1);
        assert_eq!(outcome.skipped, vec!["2".to_string()]);
        assert_eq!(store.get_product("1").await.unwrap().unwrap().code, "fresh");
        assert_eq!(
            store.get_product("2").await.unwrap().unwrap().status,
            ProductStatus::Edited
        );
        assert!(store.get_product("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_firmware_upsert_preserves_counters() {
        let store = InMemoryStore::new();
        let row = FirmwareAttachment {
            id: 100,
            hash: "URL:aa".into(),
            name: "fw.zip".into(),
            product_code: "W".into(),
            remark: "https://t/-/project/1/uploads/a/fw.zip".into(),
            status: "approved".into(),
            tag: "firmware".into(),
        };
        store.upsert_firmware_attachment(&row).await.unwrap();
        store.increment_download_count(100).await.unwrap();
        let again = store.upsert_firmware_attachment(&row).await.unwrap().unwrap();
        assert_eq!(again.download_count, 1);

        let next = store
            .insert_attachment(&NewAttachment::default())
            .await
            .unwrap();
        assert_eq!(next.id, 101);
    }

    #[tokio::test]
    async fn test_firmware_upsert_leaves_user_upload_alone() {
        let store = InMemoryStore::new();
        let mut row = FirmwareAttachment {
            id: 1000,
            hash: "URL:a".into(),
            name: "a.zip".into(),
            product_code: "A".into(),
            remark: "https://t/-/project/1/uploads/a/a.zip".into(),
            status: "approved".into(),
            tag: "firmware".into(),
        };
        store.upsert_firmware_attachment(&row).await.unwrap();

        let manual = store
            .insert_attachment(&NewAttachment {
                hash: "ab".repeat(32),
                name: "manual.pdf".into(),
                tag: "manual".into(),
                product_code: "M".into(),
                status: "draft".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(manual.id, 1001);

        row.id = 1001;
        row.hash = "URL:b".into();
        assert!(store.upsert_firmware_attachment(&row).await.unwrap().is_none());

        let kept = store.get_attachment(1001).await.unwrap().unwrap();
        assert_eq!(kept, manual);
    }
}
