// src/lib.rs

//! swift-mirror
//!
//! Mirrors file trees from heterogeneous read-only sources (HTTP directory
//! listings, Yum and Debian package repositories, GitHub release assets,
//! and Swift containers) into Swift object storage.
//!
//! # Architecture
//!
//! - Batch pipeline: one scraper feeds N transfer workers over a bounded
//!   channel; a cleaner removes vanished files afterwards; a reporter
//!   aggregates the outcome
//! - Change detection: the source's `Etag`/`Last-Modified` are stored as
//!   object metadata on the target and replayed as conditional request
//!   headers on the next run
//! - Repository-aware scraping: Yum and Debian sources walk repository
//!   metadata and upload the top-level indexes last, so readers of the
//!   mirror never see metadata referencing missing packages
//! - Large objects: uploads above a configured size become static large
//!   objects; a failed upload leaves neither manifest nor segments behind

pub mod actors;
pub mod compression;
pub mod config;
pub mod dcf;
mod error;
pub mod gpg;
pub mod matcher;
pub mod sources;
pub mod swift;
pub mod transfer;

pub use error::{Error, Result};

/// Read a boolean flag from the environment (`1`, `true`, `yes`, `on`)
pub fn env_bool(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
