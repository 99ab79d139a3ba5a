//! SQLite implementation of the product and attachment row stores.
//!
//! Products are replaced per crawl generation inside one transaction.
//! Attachment comments are stored as a JSON array in a TEXT column.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use product_hub_core::models::{
    Attachment, AttachmentQuery, AttachmentUpdate, Comment, FirmwareAttachment, NewAttachment,
    Paged, Product, ProductStatus,
};
use product_hub_core::store::{fast_view, AttachmentRepo, ProductStore, ProductSyncOutcome};

use crate::config::Config;
use crate::{db, migrate};

const ATTACHMENT_COLUMNS: &str = "id, hash, name, size, mimetype, status, download_count, \
     remark, tag, product_code, comments, created_at, updated_at";

/// [`ProductStore`] + [`AttachmentRepo`] backed by a [`SqlitePool`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn product_from_row(row: &SqliteRow) -> Result<Product> {
    let status: String = row.try_get("status")?;
    Ok(Product {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        html: row.try_get("html")?,
        firmware: row.try_get("firmware")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn attachment_from_row(row: &SqliteRow) -> Result<Attachment> {
    let id: i64 = row.try_get("id")?;
    let comments: String = row.try_get("comments")?;
    let comments: Vec<Comment> = serde_json::from_str(&comments)
        .with_context(|| format!("corrupt comments for attachment {}", id))?;
    Ok(Attachment {
        id,
        hash: row.try_get("hash")?,
        name: row.try_get("name")?,
        size: row.try_get("size")?,
        mimetype: row.try_get("mimetype")?,
        status: row.try_get("status")?,
        download_count: row.try_get("download_count")?,
        remark: row.try_get("remark")?,
        tag: row.try_get("tag")?,
        product_code: row.try_get("product_code")?,
        comments,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[async_trait]
impl ProductStore for SqliteStore {
    async fn sync_products(&self, rows: &[Product]) -> Result<ProductSyncOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ProductSyncOutcome::default();

        for product in rows {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT status FROM products WHERE id = ?")
                    .bind(&product.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some(status) = existing {
                let status: ProductStatus = status.parse()?;
                if !status.is_sync_owned() {
                    outcome.skipped.push(product.id.clone());
                    continue;
                }
                sqlx::query("DELETE FROM products WHERE id = ?")
                    .bind(&product.id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query(
                r#"
                INSERT INTO products (id, code, html, firmware, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&product.id)
            .bind(&product.code)
            .bind(&product.html)
            .bind(&product.firmware)
            .bind(product.status.as_str())
            .bind(product.created_at)
            .bind(product.updated_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert product {}", product.id))?;

            outcome.inserted.push(product.clone());
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>> {
        let row = sqlx::query(
            "SELECT id, code, html, firmware, status, created_at, updated_at FROM products WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(&self, search: &str, page: i64, limit: i64) -> Result<Paged<Product>> {
        let pattern = like_pattern(search);
        let offset = (page.max(1) - 1) * limit.max(0);

        let total: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM products WHERE LOWER(code) LIKE ? ESCAPE '\'",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, code, html, firmware, status, created_at, updated_at
            FROM products
            WHERE LOWER(code) LIKE ? ESCAPE '\'
            ORDER BY status ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&pattern)
        .bind(limit.max(0))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(Paged {
            page,
            limit,
            total,
            rows: rows.iter().map(product_from_row).collect::<Result<_>>()?,
        })
    }
}

#[async_trait]
impl AttachmentRepo for SqliteStore {
    async fn insert_attachment(&self, row: &NewAttachment) -> Result<Attachment> {
        let ts = now();
        let comments = serde_json::to_string(&row.comments)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO attachments
                (hash, name, size, mimetype, status, download_count, remark, tag, product_code, comments, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&row.hash)
        .bind(&row.name)
        .bind(row.size)
        .bind(&row.mimetype)
        .bind(&row.status)
        .bind(&row.remark)
        .bind(&row.tag)
        .bind(&row.product_code)
        .bind(&comments)
        .bind(ts)
        .bind(ts)
        .fetch_one(&self.pool)
        .await?;

        self.get_attachment(id)
            .await?
            .with_context(|| format!("attachment {} vanished after insert", id))
    }

    async fn upsert_firmware_attachment(
        &self,
        row: &FirmwareAttachment,
    ) -> Result<Option<Attachment>> {
        let ts = now();
        let result = sqlx::query(
            r#"
            INSERT INTO attachments
                (id, hash, name, size, mimetype, status, download_count, remark, tag, product_code, comments, created_at, updated_at)
            VALUES (?, ?, ?, 0, '', ?, 0, ?, ?, ?, '[]', ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hash = excluded.hash,
                name = excluded.name,
                status = excluded.status,
                remark = excluded.remark,
                tag = excluded.tag,
                product_code = excluded.product_code,
                updated_at = excluded.updated_at
            WHERE attachments.tag = 'firmware' AND attachments.hash LIKE 'URL:%'
            "#,
        )
        .bind(row.id)
        .bind(&row.hash)
        .bind(&row.name)
        .bind(&row.status)
        .bind(&row.remark)
        .bind(&row.tag)
        .bind(&row.product_code)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert firmware attachment {}", row.id))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_attachment(row.id)
            .await?
            .with_context(|| format!("attachment {} vanished after upsert", row.id))
            .map(Some)
    }

    async fn get_attachment(&self, id: i64) -> Result<Option<Attachment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attachments WHERE id = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(attachment_from_row).transpose()
    }

    async fn find_attachment_by_hash(&self, hash: &str) -> Result<Option<Attachment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attachments WHERE hash = ? ORDER BY id ASC LIMIT 1",
            ATTACHMENT_COLUMNS
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(attachment_from_row).transpose()
    }

    async fn list_attachments(&self, query: &AttachmentQuery) -> Result<Paged<Attachment>> {
        // Empty search / product_code disable their respective filters.
        let filter = r#"
            (? = '' OR LOWER(remark) LIKE ? ESCAPE '\' OR LOWER(name) LIKE ? ESCAPE '\' OR product_code = ?)
            AND (? = '' OR product_code = ?)
        "#;
        let pattern = like_pattern(&query.search);

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM attachments WHERE {}", filter))
                .bind(&query.search)
                .bind(&pattern)
                .bind(&pattern)
                .bind(&query.search)
                .bind(&query.product_code)
                .bind(&query.product_code)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM attachments WHERE {} ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
            ATTACHMENT_COLUMNS, filter
        ))
        .bind(&query.search)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&query.search)
        .bind(&query.product_code)
        .bind(&query.product_code)
        .bind(query.limit.max(0))
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        let rows = rows
            .iter()
            .map(|r| {
                attachment_from_row(r).map(|a| if query.fast { fast_view(&a) } else { a })
            })
            .collect::<Result<Vec<_>>>()?;

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
        let mut tx = self.pool.begin().await?;

        let comments: Option<String> =
            sqlx::query_scalar("SELECT comments FROM attachments WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(comments) = comments else {
            return Ok(None);
        };

        let mut history: Vec<Comment> = serde_json::from_str(&comments)
            .with_context(|| format!("corrupt comments for attachment {}", id))?;
        if let Some(c) = comment {
            history.push(c);
        }

        sqlx::query(
            r#"
            UPDATE attachments SET
                name = COALESCE(?, name),
                remark = COALESCE(?, remark),
                tag = COALESCE(?, tag),
                status = COALESCE(?, status),
                download_count = COALESCE(?, download_count),
                product_code = COALESCE(?, product_code),
                comments = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(&update.remark)
        .bind(&update.tag)
        .bind(&update.status)
        .bind(update.download_count)
        .bind(&update.product_code)
        .bind(serde_json::to_string(&history)?)
        .bind(now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.get_attachment(id).await
    }

    async fn increment_download_count(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE attachments SET download_count = download_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use product_hub_core::models::CommentAction;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteStore {
        let pool = db::connect_path(&tmp.path().join("data/phub.sqlite"))
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn product(id: &str, status: ProductStatus) -> Product {
        Product {
            id: id.to_string(),
            code: format!("Code-{}", id),
            html: "<p/>".into(),
            firmware: String::new(),
            status,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("A_b%"), r"%a\_b\%%");
    }

    #[tokio::test]
    async fn test_sync_products_skips_edited_rows() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;

        store
            .sync_products(&[product("1", ProductStatus::Crawler), product("2", ProductStatus::Crawler)])
            .await
            .unwrap();
        sqlx::query("UPDATE products SET status = 'edited', code = 'Manual' WHERE id = '2'")
            .execute(store.pool())
            .await
            .unwrap();

        let mut fresh = product("1", ProductStatus::Crawler);
        fresh.code = "Renamed".into();
        let outcome = store
            .sync_products(&[fresh, product("2", ProductStatus::Crawler)])
            .await
            .unwrap();

        assert_eq!(outcome.inserted.len(), 1);
        assert_eq!(outcome.skipped, vec!["2".to_string()]);
        assert_eq!(store.get_product("1").await.unwrap().unwrap().code, "Renamed");
        let kept = store.get_product("2").await.unwrap().unwrap();
        assert_eq!(kept.code, "Manual");
        assert_eq!(kept.status, ProductStatus::Edited);
    }

    #[tokio::test]
    async fn test_list_products_search_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .sync_products(&[product("10", ProductStatus::Crawler), product("20", ProductStatus::Approved)])
            .await
            .unwrap();

        let page = store.list_products("code-1", 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].id, "10");

        let all = store.list_products("", 1, 10).await.unwrap();
        assert_eq!(all.total, 2);
        // "approved" sorts before "crawler"
        assert_eq!(all.rows[0].id, "20");
    }

    #[tokio::test]
    async fn test_firmware_upsert_keeps_counters_and_comments() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let mut row = FirmwareAttachment {
            id: 100,
            hash: "URL:aa".into(),
            name: "fw.zip".into(),
            product_code: "Widget".into(),
            remark: "https://t/-/project/1/uploads/a/fw.zip".into(),
            status: "approved".into(),
            tag: "firmware".into(),
        };
        store.upsert_firmware_attachment(&row).await.unwrap();
        store.increment_download_count(100).await.unwrap();
        store
            .update_attachment(
                100,
                &AttachmentUpdate::default(),
                Some(Comment::now("qa@example.com", "checked", CommentAction::Comment)),
            )
            .await
            .unwrap();

        row.name = "fw2.zip".into();
        let again = store.upsert_firmware_attachment(&row).await.unwrap().unwrap();
        assert_eq!(again.name, "fw2.zip");
        assert_eq!(again.download_count, 1);
        assert_eq!(again.comments.len(), 1);

        // Serial ids continue past the forced id
        let next = store
            .insert_attachment(&NewAttachment {
                hash: "h".into(),
                status: "draft".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(next.id > 100);
    }

    #[tokio::test]
    async fn test_firmware_upsert_never_overwrites_user_upload() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
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

        // The next serial id lands right after the forced one.
        let manual = store
            .insert_attachment(&NewAttachment {
                hash: "cd".repeat(32),
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
        row.product_code = "C".into();
        assert!(store.upsert_firmware_attachment(&row).await.unwrap().is_none());

        let kept = store.get_attachment(1001).await.unwrap().unwrap();
        assert_eq!(kept.hash, "cd".repeat(32));
        assert_eq!(kept.tag, "manual");
        assert_eq!(kept.name, "manual.pdf");
        assert_eq!(kept.product_code, "M");
    }

    #[tokio::test]
    async fn test_find_by_hash_lowest_id_wins() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let new = NewAttachment {
            hash: "dup".into(),
            name: "a.bin".into(),
            status: "draft".into(),
            ..Default::default()
        };
        let first = store.insert_attachment(&new).await.unwrap();
        store.insert_attachment(&new).await.unwrap();
        let found = store.find_attachment_by_hash("dup").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_attachment_by_hash("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_attachments_filters_and_fast_view() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        for (name, code, remark) in [
            ("manual.pdf", "Plug-S", "user manual"),
            ("fw.zip", "Plug-S", "https://t/uploads/x/fw.zip"),
            ("cert.pdf", "Dimmer", "CE certificate"),
        ] {
            store
                .insert_attachment(&NewAttachment {
                    hash: format!("h-{}", name),
                    name: name.into(),
                    size: 10,
                    status: "draft".into(),
                    remark: remark.into(),
                    tag: "manual".into(),
                    product_code: code.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let by_code = store
            .list_attachments(&AttachmentQuery {
                product_code: "Plug-S".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_code.total, 2);

        let search = store
            .list_attachments(&AttachmentQuery {
                search: "CERT".into(),
                fast: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(search.total, 1);
        assert_eq!(search.rows[0].name, "cert.pdf");
        assert_eq!(search.rows[0].size, 0);
        assert!(search.rows[0].hash.is_empty());

        let exact_code = store
            .list_attachments(&AttachmentQuery {
                search: "Dimmer".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(exact_code.total, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let res = store
            .update_attachment(42, &AttachmentUpdate::default(), None)
            .await
            .unwrap();
        assert!(res.is_none());
    }
}
