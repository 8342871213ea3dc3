// src/sources/http.rs

//! HTTP directory listings as a source.
//!
//! A `UrlSource` scrapes the HTML index pages that web servers generate for
//! directories, following relative links downwards. Apache and nginx style
//! listings both work; links that leave the tree (absolute URLs, absolute
//! paths, `..` components, sort-order query links) are ignored.

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use regex::Regex;
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use std::sync::LazyLock;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{
    join_paths, FileBody, FileSpec, FileState, GetConditions, ListError, Source, SourceHeaders,
};
use crate::error::{Error, Result};
use crate::matcher::clean_path;

/// Default size of one ranged download chunk (512 MiB)
const DEFAULT_SEGMENT_SIZE: u64 = 512 << 20;

/// User agent sent on every outgoing request
pub const USER_AGENT: &str = concat!("swift-mirror/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client configuration: user agent, and optionally
/// disabled certificate verification for local debugging (`INSECURE=1`;
/// never set this in production).
pub fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(crate::env_bool("INSECURE"))
}

/// A plain HTTP client with the process-wide defaults
pub fn default_client() -> Result<reqwest::Client> {
    client_builder()
        .build()
        .map_err(|e| Error::Config(format!("cannot create HTTP client: {e}")))
}

/// A source that is accessible via HTTP directory listings
#[derive(Clone, Default, Deserialize)]
pub struct UrlSource {
    #[serde(rename = "url")]
    pub url_string: String,
    /// Client certificate for mutual TLS (must be set together with `key`)
    #[serde(default, rename = "cert")]
    pub client_certificate_path: String,
    #[serde(default, rename = "key")]
    pub client_certificate_key_path: String,
    /// Custom CA bundle for the server certificate
    #[serde(default, rename = "ca")]
    pub server_ca_path: String,
    /// Ranged downloads for large files (default on)
    #[serde(default, rename = "segmenting")]
    pub segmenting_in: Option<bool>,
    #[serde(default, rename = "segment_bytes")]
    pub segment_size: u64,

    #[serde(skip)]
    pub url: Option<Url>,
    #[serde(skip)]
    pub segmenting: bool,
    #[serde(skip)]
    pub client: Option<reqwest::Client>,
}

impl UrlSource {
    /// Validate the configuration and normalize the URL
    pub fn validate(&mut self, name: &str) -> Vec<Error> {
        let mut errors = Vec::new();

        if self.url_string.is_empty() {
            errors.push(Error::Config(format!("missing value for {name}.url")));
        } else {
            match Url::parse(&self.url_string) {
                Ok(mut url) => {
                    if url.scheme() != "http" && url.scheme() != "https" {
                        errors.push(Error::Config(format!(
                            "invalid value for {}.url: unsupported scheme {:?}",
                            name,
                            url.scheme()
                        )));
                    }
                    if url.query().is_some() || url.fragment().is_some() {
                        errors.push(Error::Config(format!(
                            "invalid value for {name}.url: must not have a query or fragment"
                        )));
                    }
                    // a directory URL needs the trailing slash, otherwise
                    // relative links resolve one level too high
                    if !url.path().ends_with('/') {
                        url.set_path(&format!("{}/", url.path()));
                    }
                    self.url = Some(url);
                }
                Err(e) => {
                    errors.push(Error::Config(format!(
                        "invalid value for {name}.url: {e}"
                    )));
                }
            }
        }

        if !self.client_certificate_path.is_empty() || !self.client_certificate_key_path.is_empty()
        {
            if self.client_certificate_path.is_empty() {
                errors.push(Error::Config(format!("missing value for {name}.cert")));
            }
            if self.client_certificate_key_path.is_empty() {
                errors.push(Error::Config(format!("missing value for {name}.key")));
            }
        }

        self.segmenting = self.segmenting_in.unwrap_or(true);
        if self.segment_size == 0 {
            self.segment_size = DEFAULT_SEGMENT_SIZE;
        }

        errors
    }

    /// Build the HTTP client, loading TLS material where configured
    pub fn connect_client(&mut self) -> Result<()> {
        let mut builder = client_builder();

        if !self.client_certificate_path.is_empty() {
            let mut pem = std::fs::read(&self.client_certificate_path).map_err(|e| {
                Error::Io(format!(
                    "cannot load client certificate from {}: {e}",
                    self.client_certificate_path
                ))
            })?;
            let key = std::fs::read(&self.client_certificate_key_path).map_err(|e| {
                Error::Io(format!(
                    "cannot load client certificate key from {}: {e}",
                    self.client_certificate_key_path
                ))
            })?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                Error::Io(format!(
                    "cannot parse client certificate {}: {e}",
                    self.client_certificate_path
                ))
            })?;
            debug!("client certificate {} loaded", self.client_certificate_path);
            builder = builder.identity(identity).use_rustls_tls();
        }

        if !self.server_ca_path.is_empty() {
            let pem = std::fs::read(&self.server_ca_path).map_err(|e| {
                Error::Io(format!(
                    "cannot load CA certificate from {}: {e}",
                    self.server_ca_path
                ))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::Io(format!(
                    "cannot parse CA certificate {}: {e}",
                    self.server_ca_path
                ))
            })?;
            debug!("server CA {} loaded", self.server_ca_path);
            builder = builder.add_root_certificate(certificate).use_rustls_tls();
        }

        self.client = Some(
            builder
                .build()
                .map_err(|e| Error::Config(format!("cannot create HTTP client: {e}")))?,
        );
        Ok(())
    }

    pub(crate) fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Config("URL source used before connect".to_string()))
    }

    /// The full URL for a path below this source
    pub(crate) fn url_for_path(&self, path: &str) -> Result<Url> {
        let base = self
            .url
            .as_ref()
            .ok_or_else(|| Error::Config("URL source used before validate".to_string()))?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("cannot resolve path {path:?}: {e}")))
    }

    /// Download one file into memory at scrape time and remember its
    /// contents and headers in `cache`, so the transfer phase re-uses the
    /// exact bytes that the scraper saw.
    pub(crate) async fn get_file_contents(
        &self,
        path: &str,
        cache: &mut std::collections::HashMap<String, FileSpec>,
    ) -> std::result::Result<(Bytes, String), ListError> {
        let url = self
            .url_for_path(path)
            .map_err(|e| ListError::failed(path, e.to_string()))?;
        let uri = url.to_string();

        let response = self
            .client()
            .map_err(|e| ListError::failed(&uri, e.to_string()))?
            .get(url)
            .send()
            .await
            .map_err(|e| ListError::failed(&uri, format!("GET failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ListError::failed(
                &uri,
                format!("GET returned status {}", response.status()),
            ));
        }

        let headers = source_headers_from_response(&response);
        let contents = response
            .bytes()
            .await
            .map_err(|e| ListError::failed(&uri, format!("GET failed: {e}")))?;

        cache.insert(
            path.to_string(),
            FileSpec {
                path: path.to_string(),
                contents: Some(contents.clone()),
                headers: Some(headers),
                ..FileSpec::default()
            },
        );
        Ok((contents, uri))
    }

    async fn plain_get(&self, url: Url, conditions: &GetConditions) -> Result<Response> {
        let mut request = self.client()?.get(url.clone());
        if let Some(etag) = &conditions.if_none_match {
            request = request.header("If-None-Match", etag);
        }
        if let Some(mtime) = &conditions.if_modified_since {
            request = request.header("If-Modified-Since", mtime);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Download(format!("skipping {url}: GET failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NOT_MODIFIED {
            return Err(Error::Download(format!(
                "skipping {url}: GET returned unexpected status code: expected 200 or 304, but got {}",
                status.as_u16()
            )));
        }
        Ok(response)
    }

    /// Stream a large file in segment-sized `Range` requests, so a
    /// connection reset costs one chunk rather than the whole download
    fn ranged_body(&self, url: Url, total_size: u64) -> Result<FileBody> {
        let client = self.client()?.clone();
        let chunk_size = self.segment_size;
        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);

        tokio::spawn(async move {
            let mut start = 0u64;
            while start < total_size {
                let end = (start + chunk_size - 1).min(total_size - 1);
                let result = client
                    .get(url.clone())
                    .header("Range", format!("bytes={start}-{end}"))
                    .send()
                    .await;
                let response = match result {
                    Ok(response)
                        if response.status() == StatusCode::PARTIAL_CONTENT
                            || response.status().is_success() =>
                    {
                        response
                    }
                    Ok(response) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(format!(
                                "ranged GET {url} returned status {}",
                                response.status()
                            ))))
                            .await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(std::io::Error::other(e))).await;
                        return;
                    }
                };
                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    let failed = match item {
                        Ok(chunk) => tx.send(Ok(chunk)).await.is_err(),
                        Err(e) => {
                            let _ = tx.send(Err(std::io::Error::other(e))).await;
                            true
                        }
                    };
                    if failed {
                        return;
                    }
                }
                start = end + 1;
            }
        });

        Ok(Box::new(StreamReader::new(ReceiverStream::new(rx))))
    }
}

fn source_headers_from_response(response: &Response) -> SourceHeaders {
    let get = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    SourceHeaders {
        etag: get("etag"),
        last_modified: get("last-modified"),
        content_type: get("content-type"),
    }
}

fn file_state_from_response(response: &Response) -> FileState {
    let get = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    FileState {
        etag: get("etag"),
        last_modified: get("last-modified"),
        size_bytes: get("content-length").and_then(|v| v.parse().ok()),
        expiry_time: None,
        skip_transfer: response.status() == StatusCode::NOT_MODIFIED,
        content_type: get("content-type"),
    }
}

pub(crate) fn stream_body(response: Response) -> FileBody {
    let stream = response.bytes_stream().map_err(std::io::Error::other);
    Box::new(StreamReader::new(stream))
}

#[async_trait::async_trait]
impl Source for UrlSource {
    fn validate(&mut self, name: &str) -> Vec<Error> {
        UrlSource::validate(self, name)
    }

    async fn connect(&mut self) -> Result<()> {
        self.connect_client()
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        Err(ListError::NotSupported)
    }

    async fn list_entries(
        &self,
        directory_path: &str,
    ) -> std::result::Result<Vec<FileSpec>, ListError> {
        let mut url = self
            .url_for_path(directory_path)
            .map_err(|e| ListError::failed(directory_path, e.to_string()))?;
        // a well-formed index listing needs the trailing slash; without it
        // some servers render a listing with unusable relative links
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        let uri = url.to_string();
        debug!("scraping {}", uri);

        let response = self
            .client()
            .map_err(|e| ListError::failed(&uri, e.to_string()))?
            .get(url)
            .send()
            .await
            .map_err(|e| ListError::failed(&uri, format!("GET failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ListError::failed(
                &uri,
                format!("GET returned status {}", response.status()),
            ));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/html") {
            return Err(ListError::failed(
                &uri,
                format!("GET returned unexpected Content-Type: {content_type}"),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ListError::failed(&uri, format!("GET failed: {e}")))?;

        let mut result = Vec::new();
        for href in extract_hrefs(&body) {
            match classify_link(&href) {
                Some(link_path) => {
                    let is_directory = link_path.ends_with('/');
                    result.push(FileSpec {
                        path: join_paths(directory_path, &link_path),
                        is_directory,
                        ..FileSpec::default()
                    });
                }
                None => {
                    debug!("scrape {}: ignoring href {:?}", uri, href);
                }
            }
        }
        Ok(result)
    }

    async fn get_file(
        &self,
        spec: &FileSpec,
        conditions: &GetConditions,
    ) -> Result<(Option<FileBody>, FileState)> {
        let url = self.url_for_path(&spec.path)?;
        let response = self.plain_get(url.clone(), conditions).await?;
        let state = file_state_from_response(&response);
        if state.skip_transfer {
            return Ok((None, state));
        }

        match state.size_bytes {
            // very large files are streamed in ranged chunks
            Some(total) if self.segmenting && total > self.segment_size => {
                drop(response);
                Ok((Some(self.ranged_body(url, total)?), state))
            }
            _ => Ok((Some(stream_body(response)), state)),
        }
    }
}

/// Anchor hrefs in an HTML directory listing
static HREF_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("static regex")
});

/// `..` as a path component
static DOTDOT_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|/)\.\.(?:$|/)").expect("static regex"));

/// Extract all anchor targets from an HTML document
fn extract_hrefs(html: &str) -> Vec<String> {
    HREF_RX
        .captures_iter(html)
        .filter_map(|captures| {
            captures
                .get(1)
                .or_else(|| captures.get(2))
                .or_else(|| captures.get(3))
                .map(|m| decode_entities(m.as_str()))
        })
        .filter(|href| !href.is_empty())
        .collect()
}

/// Decide whether an anchor target is a listing entry we can follow.
/// Returns the cleaned relative path (with a trailing slash for
/// subdirectories), or `None` for links that leave the directory tree.
fn classify_link(href: &str) -> Option<String> {
    // external links with full URLs, including protocol-relative ones
    if href.starts_with("//") || Url::parse(href).is_ok() {
        return None;
    }
    // links with a query part (directory listings use these for adjustable
    // sorting) and fragments
    if href.contains('?') || href.contains('#') {
        return None;
    }
    // absolute paths to the toplevel of the server, e.g. "/static/site.css"
    if href.starts_with('/') {
        return None;
    }
    // links leading outside the current directory
    if DOTDOT_RX.is_match(href) {
        return None;
    }

    let mut link_path = clean_path(href);
    if link_path == "/" || link_path == "." {
        return None;
    }
    if href.ends_with('/') {
        link_path.push('/');
    }
    Some(link_path)
}

/// Decode the few HTML entities that show up in index hrefs
fn decode_entities(href: &str) -> String {
    href.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}
