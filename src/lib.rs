//! # Product Hub
//!
//! Keeps a local product catalogue in step with a wiki page tree and
//! stores product files (manuals, certificates, firmware bundles) in a
//! content-addressed blob store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Wiki   │──▶│   Crawler    │──▶│  Reconciler  │──▶│  SQLite  │
//! │   tree   │   │ batch of 5   │   │ products txn │   │  rows    │
//! └──────────┘   └──────────────┘   └──────┬───────┘   └──────────┘
//!                                          │
//! ┌──────────┐   ┌──────────────┐          ▼
//! │ Tracker  │──▶│   Resolver   │   ┌──────────────┐   ┌──────────┐
//! │  issues  │   │ issue → .zip │   │ Materializer │──▶│  Blobs   │
//! └──────────┘   └──────────────┘   │ (background) │   │ <sha256> │
//!                                   └──────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! phub init                     # create database
//! phub sync                     # crawl, reconcile, fetch firmware
//! phub attachments --search zip
//! phub serve                    # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`wiki`] | Wiki client, firmware cell extraction, tree crawler |
//! | [`retry`] | Per-attempt timeout with linear backoff |
//! | [`tracker`] | Tracker client and firmware link resolver |
//! | [`blobs`] | Content-addressed file storage |
//! | [`attachments`] | Upload, download and metadata operations |
//! | [`sync`] | Sync pass orchestration |
//! | [`materialize`] | Background fetch of remote-backed attachments |
//! | [`sqlite_store`] | SQLite row stores |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod attachments;
pub mod blobs;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod materialize;
pub mod migrate;
pub mod retry;
pub mod server;
pub mod sqlite_store;
pub mod sync;
pub mod tracker;
pub mod wiki;
