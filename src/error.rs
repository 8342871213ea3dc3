// src/error.rs

//! Central error type for swift-mirror.
//!
//! Every I/O call site maps its failure into one of these variants; the
//! pipeline actors only ever see typed errors. `main` reports collected
//! errors and turns them into the process exit code.

use thiserror::Error;

/// Errors that can occur during a mirror run
#[derive(Error, Debug)]
pub enum Error {
    /// Bad YAML, missing required field, malformed regex, unparseable URL.
    /// Fatal before any I/O is performed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cannot authenticate or prepare a target container. Fatal at job
    /// compile time.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A GET from a source failed
    #[error("download failed: {0}")]
    Download(String),

    /// A HEAD/PUT/DELETE against the target failed
    #[error("upload failed: {0}")]
    Upload(String),

    /// The target answered a PUT with status 498; the object was definitely
    /// not written, so no cleanup delete must be attempted
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Malformed XML, DCF, JSON or HTTP header value
    #[error("parse error: {0}")]
    Parse(String),

    /// Local file system failure (certificates, config file)
    #[error("I/O error: {0}")]
    Io(String),

    /// A repository signature did not verify
    #[error("GPG verification failed: {0}")]
    GpgVerification(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
