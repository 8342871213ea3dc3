// src/swift/mod.rs

//! Object storage access.
//!
//! The transfer engine, the cleaner and the Swift source variant all talk to
//! object storage through the `ObjectStore` trait. The production
//! implementation is `client::SwiftClient`, a thin Keystone-v3 + Swift HTTP
//! client; tests substitute an in-memory store.

pub mod client;

pub use client::{connect, SwiftClient, SwiftCredentials};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::sources::GetConditions;

/// Streamed object contents for uploads
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

/// Headers of an object as returned by HEAD/GET
#[derive(Debug, Default, Clone)]
pub struct ObjectHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// Unix timestamp from `X-Delete-At`
    pub delete_at: Option<i64>,
    /// `container/object` target if this object is a symlink
    pub symlink_target: Option<String>,
    /// User metadata (`X-Object-Meta-*`), keys lowercased without the prefix
    pub metadata: HashMap<String, String>,
}

/// Headers attached to an upload
#[derive(Debug, Default, Clone)]
pub struct UploadHeaders {
    pub content_type: Option<String>,
    /// User metadata, stored as `X-Object-Meta-<key>`
    pub metadata: HashMap<String, String>,
    /// Unix timestamp for `X-Delete-At`
    pub delete_at: Option<i64>,
}

/// Result of a conditional GET
pub enum GetOutcome {
    /// The conditional headers matched; nothing was returned
    NotModified,
    /// The object was returned
    Found {
        body: Box<dyn AsyncRead + Send + Unpin>,
        headers: ObjectHeaders,
    },
}

/// One entry of a container listing
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    /// Full object name (or prefix for pseudo-directories)
    pub name: String,
    /// True for `subdir` entries of a delimiter listing
    pub is_pseudo_directory: bool,
    /// `container/object` target for symlink objects
    pub symlink_target: Option<String>,
}

/// One segment reference of a static large object manifest
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// `container/object` path of the segment
    pub path: String,
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Outcome of a bulk delete request
#[derive(Debug, Default)]
pub struct BulkDeleteOutcome {
    pub deleted: u64,
    /// Per-object errors as (object path, status) pairs
    pub errors: Vec<(String, String)>,
}

/// Operations on a Swift-compatible object store.
///
/// All object names are full names (including any prefix); containers are
/// passed separately.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a container if it does not exist yet (idempotent)
    async fn create_container(&self, container: &str) -> Result<()>;

    /// HEAD an object. Returns `None` if the object does not exist.
    async fn head_object(&self, container: &str, name: &str) -> Result<Option<ObjectHeaders>>;

    /// GET an object, honouring conditional headers
    async fn get_object(
        &self,
        container: &str,
        name: &str,
        conditions: &GetConditions,
    ) -> Result<GetOutcome>;

    /// PUT an object; returns the Etag reported by the server
    async fn put_object(
        &self,
        container: &str,
        name: &str,
        headers: &UploadHeaders,
        body: ObjectBody,
    ) -> Result<String>;

    /// PUT a symlink object pointing at `target` (`container/object`)
    async fn put_symlink(
        &self,
        container: &str,
        name: &str,
        target: &str,
        headers: &UploadHeaders,
    ) -> Result<()>;

    /// PUT a static large object manifest referencing the given segments
    async fn put_slo_manifest(
        &self,
        container: &str,
        name: &str,
        headers: &UploadHeaders,
        segments: &[SegmentInfo],
    ) -> Result<()>;

    /// DELETE an object. A missing object is not an error.
    async fn delete_object(&self, container: &str, name: &str) -> Result<()>;

    /// Delete many objects in one request
    async fn bulk_delete(&self, container: &str, names: &[String]) -> Result<BulkDeleteOutcome>;

    /// List object names under a prefix. With a delimiter, common prefixes
    /// are reported as pseudo-directories.
    async fn list_objects(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<ObjectEntry>>;

    /// Whether the server advertises symlink support in its capabilities
    fn supports_symlinks(&self) -> bool;
}
