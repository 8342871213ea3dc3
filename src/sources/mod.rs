// src/sources/mod.rs

//! The polymorphic source model.
//!
//! A `Source` is a place files can be enumerated and fetched from. The five
//! variants (plain HTTP directory listings, Yum repositories, Debian
//! repositories, GitHub release assets, Swift containers) all implement the
//! same contract; the scraper drives them without knowing which kind it is
//! talking to.
//!
//! Sources that walk repository metadata (`yum`, `debian`) enumerate the
//! whole tree in one `list_all_files` call, in an order that keeps mirrors
//! consistent for concurrent readers: the top-level index files come last.
//! Directory-walking sources return the `NotSupported` sentinel from
//! `list_all_files` and are driven through `list_entries` instead.

pub mod debian;
pub mod github;
pub mod http;
pub mod swift;
pub mod yum;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::matcher::clean_path;

/// Streamed file contents returned by `Source::get_file`
pub type FileBody = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata for a file discovered by scraping. The only required field is
/// `path`.
///
/// Sources that download some files early (while following repository
/// metadata) pass the downloaded contents and response headers along, so the
/// transfer phase does not fetch them a second time. This also guarantees
/// that the uploaded packages correspond to the uploaded metadata even if
/// the source repository changes mid-run.
#[derive(Debug, Default, Clone)]
pub struct FileSpec {
    /// Path relative to the source root; slashes separate components
    pub path: String,
    /// True for subdirectories reported by directory-walking sources
    pub is_directory: bool,
    /// Set when the source object is a symlink to another object in the same
    /// container
    pub symlink_target_path: Option<String>,
    /// Contents cached at scrape time
    pub contents: Option<Bytes>,
    /// Response headers captured together with `contents`
    pub headers: Option<SourceHeaders>,
    /// Alternate download handle for sources that address files by ID
    /// rather than by path (GitHub release assets)
    pub download_path: Option<String>,
    /// Modification time, where the source reports one during enumeration
    pub last_modified: Option<DateTime<Utc>>,
}

/// Response headers remembered for a file that was downloaded at scrape time
#[derive(Debug, Default, Clone)]
pub struct SourceHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

/// The state of a source file as reported by `Source::get_file`
#[derive(Debug, Default, Clone)]
pub struct FileState {
    pub etag: Option<String>,
    /// HTTP-format timestamp string, kept verbatim for storage on the target
    pub last_modified: Option<String>,
    pub size_bytes: Option<u64>,
    /// Absolute expiry time, where the source supports object expiration
    pub expiry_time: Option<DateTime<Utc>>,
    /// True when the source answered "not modified" to a conditional request
    pub skip_transfer: bool,
    pub content_type: Option<String>,
}

/// Conditional request headers derived from the target object's stored
/// source metadata
#[derive(Debug, Default, Clone)]
pub struct GetConditions {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// An error that occurred while scraping a directory or repository index.
///
/// A listing error does not by itself stop the pipeline; the scraper retries
/// the directory up to two more times before giving up on it.
#[derive(Debug)]
pub enum ListError {
    /// Sentinel: this source does not implement the call; use the other
    /// listing method instead
    NotSupported,
    /// Listing failed at `location` (a URL or container/path)
    Failed { location: String, message: String },
}

impl ListError {
    pub fn failed(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "not supported by this source"),
            Self::Failed { location, message } => write!(f, "{location}: {message}"),
        }
    }
}

/// A place from which files can be fetched
#[async_trait]
pub trait Source: Send + Sync {
    /// Report configuration errors for this source. Called once during job
    /// compilation, before `connect`.
    fn validate(&mut self, name: &str) -> Vec<Error>;

    /// Perform source-specific one-time setup (client construction,
    /// authentication)
    async fn connect(&mut self) -> Result<()>;

    /// Enumerate every file in the source, as paths relative to the source
    /// root. Sources that must walk directory by directory return
    /// `ListError::NotSupported` and are driven through `list_entries`.
    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError>;

    /// Enumerate the files and subdirectories at one path in the source.
    /// Subdirectory specs have `is_directory` set.
    async fn list_entries(
        &self,
        directory_path: &str,
    ) -> std::result::Result<Vec<FileSpec>, ListError>;

    /// Retrieve contents and metadata for one file.
    ///
    /// Implementations must honour the conditional headers: when the origin
    /// reports "not modified", the returned body is `None` and
    /// `FileState::skip_transfer` is set.
    async fn get_file(
        &self,
        spec: &FileSpec,
        conditions: &GetConditions,
    ) -> Result<(Option<FileBody>, FileState)>;
}

/// Turn an ordered path list into `FileSpec`s, attaching cached contents
/// for the files that were already downloaded during scraping
pub(crate) fn assemble_file_specs(
    paths: Vec<String>,
    mut cache: std::collections::HashMap<String, FileSpec>,
) -> Vec<FileSpec> {
    paths
        .into_iter()
        .map(|path| {
            cache.remove(&path).unwrap_or(FileSpec {
                path,
                ..FileSpec::default()
            })
        })
        .collect()
}

/// Join a directory path and an entry name into a cleaned relative path
pub fn join_paths(directory: &str, entry: &str) -> String {
    let directory = directory.trim_matches('/');
    let entry = entry.trim_start_matches('/');
    let joined = if directory.is_empty() {
        clean_path(entry)
    } else {
        clean_path(&format!("{directory}/{entry}"))
    };
    if joined == "/" {
        String::new()
    } else {
        joined
    }
}

/// Parse an HTTP-format timestamp (RFC 7231 IMF-fixdate and its RFC 2822
/// relatives)
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "a.txt"), "a.txt");
        assert_eq!(join_paths("sub", "b.txt"), "sub/b.txt");
        assert_eq!(join_paths("sub/", "nested/"), "sub/nested");
        assert_eq!(join_paths("", "a//b"), "a/b");
    }

    #[test]
    fn test_parse_http_date() {
        let parsed = parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(parsed.timestamp(), 784887151);
        assert!(parse_http_date("not a date").is_none());
    }
}
