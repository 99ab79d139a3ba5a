//! # Product Hub Core
//!
//! Shared, I/O-free logic for Product Hub: data models, firmware link
//! helpers, content hashing, and the row store abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem code.

pub mod firmware;
pub mod hash;
pub mod models;
pub mod store;
