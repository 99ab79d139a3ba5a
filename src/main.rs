//! # Product Hub CLI (`phub`)
//!
//! ## Usage
//!
//! ```bash
//! phub --config ./config/phub.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `phub init` | Create the SQLite database and run schema migrations |
//! | `phub sync` | Crawl the wiki, reconcile products, materialize firmware |
//! | `phub materialize` | Fetch all remote-backed attachments into local storage |
//! | `phub upload <file>` | Store a file as a draft attachment |
//! | `phub download <hash>` | Write an attachment's bytes to disk |
//! | `phub attachments` | List attachments |
//! | `phub products` | List products |
//! | `phub delete <id>` | Soft-delete an attachment |
//! | `phub serve` | Start the HTTP API |
//!
//! Secrets come from the environment: `WIKI_API_TOKEN` and `TRACKER_TOKEN`.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use product_hub::app::App;
use product_hub::attachments::UploadMeta;
use product_hub::sqlite_store::SqliteStore;
use product_hub::{config, logging, migrate, server};
use product_hub_core::models::AttachmentQuery;
use product_hub_core::store::ProductStore;

/// Product Hub: wiki product sync and content-addressed firmware storage.
#[derive(Parser)]
#[command(name = "phub", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/phub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run a full sync pass.
    ///
    /// Waits for the background materialization of firmware files to
    /// finish unless `--no-materialize` is given.
    Sync {
        /// Skip fetching remote firmware files after the sync.
        #[arg(long)]
        no_materialize: bool,
    },

    /// Fetch every attachment still backed by a remote URL.
    Materialize,

    /// Upload a local file as a draft attachment.
    Upload {
        file: PathBuf,

        /// Attachment name. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,

        /// One of: manual, firmware, printing, testing, certificate.
        #[arg(long, default_value = "manual")]
        tag: String,

        #[arg(long, default_value = "")]
        remark: String,

        #[arg(long, default_value = "")]
        product_code: String,

        /// Uploader email recorded in the history.
        #[arg(long, default_value = "")]
        email: String,

        /// MIME type. Defaults to application/octet-stream.
        #[arg(long, default_value = "")]
        mimetype: String,
    },

    /// Download an attachment by hash.
    Download {
        hash: String,

        /// Output path. Defaults to `{id}.{name}` in the current directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List attachments.
    Attachments {
        #[arg(long, default_value = "")]
        search: String,

        #[arg(long, default_value = "")]
        product_code: String,

        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long, default_value_t = 60)]
        limit: i64,
    },

    /// List products.
    Products {
        #[arg(long, default_value = "")]
        search: String,

        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long, default_value_t = 60)]
        limit: i64,
    },

    /// Soft-delete an attachment.
    Delete {
        id: i64,

        #[arg(long, default_value = "")]
        email: String,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { no_materialize } => {
            let app = App::from_config(&cfg).await?;
            if no_materialize {
                let report = app.reconciler.sync().await?;
                print_sync(&report);
            } else {
                let run = app.reconciler.run().await?;
                print_sync(&run.report);
                if let Some(handle) = run.materialization {
                    let m = handle.wait().await;
                    println!(
                        "materialized {}/{} remote attachments ({} failed)",
                        m.materialized, m.attempted, m.failed
                    );
                }
            }
        }
        Commands::Materialize => {
            let app = App::from_config(&cfg).await?;
            let m = app.materializer.run().await;
            println!(
                "materialized {}/{} remote attachments ({} failed)",
                m.materialized, m.attempted, m.failed
            );
        }
        Commands::Upload {
            file,
            name,
            tag,
            remark,
            product_code,
            email,
            mimetype,
        } => {
            let attachments = App::attachment_service(&cfg).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let attachment = attachments
                .upload(
                    &bytes,
                    UploadMeta {
                        name,
                        mimetype,
                        tag,
                        remark,
                        product_code,
                        email,
                    },
                )
                .await?;
            println!("uploaded attachment {}", attachment.id);
            println!("  hash: {}", attachment.hash);
            println!("  size: {}", attachment.size);
            println!("  url:  {}", cfg.server.download_url(&attachment.hash));
        }
        Commands::Download { hash, out } => {
            let attachments = App::attachment_service(&cfg).await?;
            let download = attachments.download(&hash).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(download.filename()));
            tokio::fs::write(&out, &download.bytes)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "wrote {} ({} bytes, {})",
                out.display(),
                download.content_length(),
                download.content_type()
            );
        }
        Commands::Attachments {
            search,
            product_code,
            page,
            limit,
        } => {
            let attachments = App::attachment_service(&cfg).await?;
            let result = attachments
                .list(&AttachmentQuery {
                    search,
                    product_code,
                    page,
                    limit,
                    fast: false,
                })
                .await?;
            println!("{} attachments (page {})", result.total, result.page);
            for a in &result.rows {
                println!(
                    "  #{:<6} {:<10} {:<9} {:<16} {}",
                    a.id, a.tag, a.status, a.product_code, a.name
                );
            }
        }
        Commands::Products {
            search,
            page,
            limit,
        } => {
            let store = SqliteStore::open(&cfg).await?;
            let result = store.list_products(&search, page, limit).await?;
            println!("{} products (page {})", result.total, result.page);
            for p in &result.rows {
                println!("  {:<12} {:<9} {:<24} {}", p.id, p.status, p.code, p.firmware);
            }
        }
        Commands::Delete { id, email } => {
            let attachments = App::attachment_service(&cfg).await?;
            let attachment = attachments.soft_delete(id, &email).await?;
            println!("attachment {} is now {}", attachment.id, attachment.status);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn print_sync(report: &product_hub::sync::SyncReport) {
    println!("synced {} products", report.products.len());
    for p in &report.products {
        println!("  {:<12} {:<9} {}", p.id, p.status, p.code);
    }
    if !report.skipped.is_empty() {
        println!("skipped (manually owned): {}", report.skipped.join(", "));
    }
    println!("firmware attachments: {}", report.attachments);
    if !report.attachment_conflicts.is_empty() {
        println!(
            "warning: firmware not attached (id held by an upload): {}",
            report.attachment_conflicts.join(", ")
        );
    }
}
