// src/swift/client.rs

//! Keystone-v3 authentication and the Swift HTTP client.
//!
//! Authenticated clients are cached process-wide, keyed by the credential
//! tuple, so that jobs sharing an account share one token. The cache is
//! written only while holding the exclusive lock; entries are never evicted
//! within a run.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{StatusCode, Url};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::{
    BulkDeleteOutcome, GetOutcome, ObjectBody, ObjectEntry, ObjectHeaders, ObjectStore,
    SegmentInfo, UploadHeaders,
};
use crate::error::{Error, Result};
use crate::sources::GetConditions;

/// Maximum number of names returned per listing request; also the paging
/// step for the listing loop
const LISTING_PAGE_SIZE: usize = 10000;

/// Credentials for one Swift account
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SwiftCredentials {
    pub auth_url: String,
    pub user_name: String,
    pub user_domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
    pub password: String,
    pub region_name: String,
}

impl SwiftCredentials {
    /// Cache key for the process-wide connection cache. Keyed by the full
    /// credential tuple, never by object identity.
    fn cache_key(&self) -> String {
        [
            &self.auth_url,
            &self.user_name,
            &self.user_domain_name,
            &self.project_name,
            &self.project_domain_name,
            &self.password,
            &self.region_name,
        ]
        .map(String::as_str)
        .join("\0")
    }
}

fn connection_cache() -> &'static RwLock<HashMap<String, Arc<SwiftClient>>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Arc<SwiftClient>>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Authenticate against Keystone and return a Swift client for the account.
///
/// Connections are cached per credential tuple; repeated calls with the same
/// credentials are idempotent and cheap.
pub async fn connect(
    credentials: &SwiftCredentials,
    http: &reqwest::Client,
) -> Result<Arc<SwiftClient>> {
    let key = credentials.cache_key();
    if let Some(client) = connection_cache()
        .read()
        .expect("connection cache lock poisoned")
        .get(&key)
    {
        return Ok(Arc::clone(client));
    }

    let client = Arc::new(SwiftClient::authenticate(credentials, http.clone()).await?);

    let mut cache = connection_cache()
        .write()
        .expect("connection cache lock poisoned");
    // another task may have authenticated concurrently; first writer wins
    let entry = cache.entry(key).or_insert_with(|| Arc::clone(&client));
    Ok(Arc::clone(entry))
}

/// An authenticated connection to one Swift account
pub struct SwiftClient {
    http: reqwest::Client,
    storage_url: Url,
    token: String,
    symlink_support: bool,
}

impl SwiftClient {
    async fn authenticate(credentials: &SwiftCredentials, http: reqwest::Client) -> Result<Self> {
        let auth_url = format!(
            "{}/auth/tokens",
            credentials.auth_url.trim_end_matches('/')
        );
        let request_body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": credentials.user_name,
                            "domain": {"name": credentials.user_domain_name},
                            "password": credentials.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": credentials.project_name,
                        "domain": {"name": credentials.project_domain_name},
                    }
                }
            }
        });

        let auth_error = |message: String| {
            Error::Auth(format!(
                "cannot authenticate to {} in {}@{} as {}@{}: {}",
                credentials.auth_url,
                credentials.project_name,
                credentials.project_domain_name,
                credentials.user_name,
                credentials.user_domain_name,
                message,
            ))
        };

        let response = http
            .post(&auth_url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| auth_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(auth_error(format!("got status {}", response.status())));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| auth_error("response carries no X-Subject-Token".to_string()))?
            .to_string();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| auth_error(e.to_string()))?;

        let storage_url = find_object_store_endpoint(&body, &credentials.region_name)
            .ok_or_else(|| {
                auth_error(format!(
                    "no object-store endpoint for region {:?} in service catalog",
                    credentials.region_name
                ))
            })?;
        let storage_url =
            Url::parse(&storage_url).map_err(|e| auth_error(format!("bad storage URL: {e}")))?;

        debug!("authenticated against {}", credentials.auth_url);

        let symlink_support = discover_symlink_support(&http, &storage_url, &token).await;

        Ok(Self {
            http,
            storage_url,
            token,
            symlink_support,
        })
    }

    fn container_url(&self, container: &str) -> Url {
        let mut url = self.storage_url.clone();
        url.path_segments_mut()
            .expect("storage URL cannot be a base")
            .push(container);
        url
    }

    fn object_url(&self, container: &str, name: &str) -> Url {
        let mut url = self.storage_url.clone();
        url.path_segments_mut()
            .expect("storage URL cannot be a base")
            .push(container)
            .extend(name.split('/'));
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http.request(method, url).header("X-Auth-Token", &self.token)
    }
}

/// Extract the public object-store endpoint for the given region from a
/// Keystone token response
fn find_object_store_endpoint(token_body: &serde_json::Value, region: &str) -> Option<String> {
    let catalog = token_body["token"]["catalog"].as_array()?;
    for service in catalog {
        if service["type"].as_str() != Some("object-store") {
            continue;
        }
        let endpoints = service["endpoints"].as_array()?;
        for endpoint in endpoints {
            if endpoint["interface"].as_str() != Some("public") {
                continue;
            }
            let endpoint_region = endpoint["region"].as_str().unwrap_or("");
            if region.is_empty() || endpoint_region == region {
                return endpoint["url"].as_str().map(str::to_string);
            }
        }
    }
    None
}

/// Probe the cluster's `/info` document for symlink support. Failures are
/// treated as "no symlink support"; the transferor then falls back to
/// copying link targets as regular objects.
async fn discover_symlink_support(http: &reqwest::Client, storage_url: &Url, token: &str) -> bool {
    let mut info_url = storage_url.clone();
    info_url.set_path("/info");
    info_url.set_query(None);
    match http
        .get(info_url)
        .header("X-Auth-Token", token)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response
            .json::<serde_json::Value>()
            .await
            .map(|caps| caps.get("symlink").is_some())
            .unwrap_or(false),
        _ => false,
    }
}

fn parse_object_headers(headers: &reqwest::header::HeaderMap) -> ObjectHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let mut metadata = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if let Some(key) = name.strip_prefix("x-object-meta-") {
            if let Ok(value) = value.to_str() {
                metadata.insert(key.to_lowercase(), value.to_string());
            }
        }
    }
    ObjectHeaders {
        etag: get("etag"),
        last_modified: get("last-modified"),
        content_type: get("content-type"),
        content_length: get("content-length").and_then(|v| v.parse().ok()),
        delete_at: get("x-delete-at").and_then(|v| v.parse().ok()),
        symlink_target: get("x-symlink-target"),
        metadata,
    }
}

fn apply_upload_headers(
    mut request: reqwest::RequestBuilder,
    headers: &UploadHeaders,
) -> reqwest::RequestBuilder {
    if let Some(content_type) = &headers.content_type {
        request = request.header("Content-Type", content_type);
    }
    for (key, value) in &headers.metadata {
        request = request.header(format!("X-Object-Meta-{key}"), value);
    }
    if let Some(delete_at) = headers.delete_at {
        request = request.header("X-Delete-At", delete_at.to_string());
    }
    request
}

/// Listings report symlink targets as account-rooted paths
/// (`/v1/<account>/<container>/<object>`); reduce that to
/// `container/object`
fn normalize_symlink_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let segments: Vec<&str> = trimmed.splitn(3, '/').collect();
    if segments.len() == 3 && segments[0] == "v1" {
        segments[2].to_string()
    } else {
        trimmed.to_string()
    }
}

/// URL-encoded `/container/object` path, as the bulk-delete middleware
/// expects it
fn encoded_object_path(container: &str, name: &str) -> String {
    let mut url = Url::parse("http://bulk.invalid").expect("static URL");
    url.path_segments_mut()
        .expect("static URL cannot be a base")
        .push(container)
        .extend(name.split('/'));
    url.path().to_string()
}

#[async_trait]
impl ObjectStore for SwiftClient {
    async fn create_container(&self, container: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, self.container_url(container))
            .send()
            .await
            .map_err(|e| Error::Auth(format!("cannot create container {container}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "cannot create container {}: got status {}",
                container,
                response.status()
            )));
        }
        Ok(())
    }

    async fn head_object(&self, container: &str, name: &str) -> Result<Option<ObjectHeaders>> {
        let response = self
            .request(reqwest::Method::HEAD, self.object_url(container, name))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("HEAD {container}/{name} failed: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(parse_object_headers(response.headers()))),
            status => Err(Error::Upload(format!(
                "HEAD {container}/{name} returned status {status}"
            ))),
        }
    }

    async fn get_object(
        &self,
        container: &str,
        name: &str,
        conditions: &GetConditions,
    ) -> Result<GetOutcome> {
        let mut request = self.request(reqwest::Method::GET, self.object_url(container, name));
        if let Some(etag) = &conditions.if_none_match {
            request = request.header("If-None-Match", etag);
        }
        if let Some(mtime) = &conditions.if_modified_since {
            request = request.header("If-Modified-Since", mtime);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Download(format!("GET {container}/{name} failed: {e}")))?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(GetOutcome::NotModified),
            status if status.is_success() => {
                let headers = parse_object_headers(response.headers());
                let stream = response.bytes_stream().map_err(std::io::Error::other);
                Ok(GetOutcome::Found {
                    body: Box::new(StreamReader::new(stream)),
                    headers,
                })
            }
            status => Err(Error::Download(format!(
                "GET {container}/{name} returned status {status}"
            ))),
        }
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        headers: &UploadHeaders,
        body: ObjectBody,
    ) -> Result<String> {
        let request = apply_upload_headers(
            self.request(reqwest::Method::PUT, self.object_url(container, name)),
            headers,
        );
        let response = request
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("PUT {container}/{name} failed: {e}")))?;
        match response.status().as_u16() {
            // Swift's rate-limit middleware answers 498; the object was
            // definitely not written in that case
            498 => Err(Error::RateLimited(format!("PUT {container}/{name}"))),
            status if (200..300).contains(&status) => Ok(response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()),
            status => Err(Error::Upload(format!(
                "PUT {container}/{name} returned status {status}"
            ))),
        }
    }

    async fn put_symlink(
        &self,
        container: &str,
        name: &str,
        target: &str,
        headers: &UploadHeaders,
    ) -> Result<()> {
        let request = apply_upload_headers(
            self.request(reqwest::Method::PUT, self.object_url(container, name)),
            headers,
        )
        .header("X-Symlink-Target", target)
        .header("Content-Length", "0");
        let response = request
            .send()
            .await
            .map_err(|e| Error::Upload(format!("symlink PUT {container}/{name} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Upload(format!(
                "symlink PUT {}/{} returned status {}",
                container,
                name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn put_slo_manifest(
        &self,
        container: &str,
        name: &str,
        headers: &UploadHeaders,
        segments: &[SegmentInfo],
    ) -> Result<()> {
        let manifest: Vec<serde_json::Value> = segments
            .iter()
            .map(|segment| {
                let mut entry = json!({
                    "path": segment.path,
                    "size_bytes": segment.size_bytes,
                });
                if let Some(etag) = &segment.etag {
                    entry["etag"] = json!(etag);
                }
                entry
            })
            .collect();

        let mut url = self.object_url(container, name);
        url.set_query(Some("multipart-manifest=put"));
        let request = apply_upload_headers(self.request(reqwest::Method::PUT, url), headers);
        let response = request
            .json(&manifest)
            .send()
            .await
            .map_err(|e| Error::Upload(format!("manifest PUT {container}/{name} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Upload(format!(
                "manifest PUT {}/{} returned status {}",
                container,
                name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, self.object_url(container, name))
            .send()
            .await
            .map_err(|e| Error::Upload(format!("DELETE {container}/{name} failed: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(Error::Upload(format!(
                "DELETE {container}/{name} returned status {status}"
            ))),
        }
    }

    async fn bulk_delete(&self, container: &str, names: &[String]) -> Result<BulkDeleteOutcome> {
        let body: String = names
            .iter()
            .map(|name| encoded_object_path(container, name) + "\n")
            .collect();

        let mut url = self.storage_url.clone();
        url.set_query(Some("bulk-delete=true"));
        let response = self
            .request(reqwest::Method::POST, url)
            .header("Content-Type", "text/plain")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Upload(format!("bulk delete failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Upload(format!(
                "bulk delete returned status {}",
                response.status()
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("bulk delete response: {e}")))?;
        let deleted = result["Number Deleted"].as_u64().unwrap_or(0);
        let errors = result["Errors"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let pair = entry.as_array()?;
                        Some((
                            pair.first()?.as_str()?.to_string(),
                            pair.get(1)?.as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(BulkDeleteOutcome { deleted, errors })
    }

    async fn list_objects(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut marker = String::new();

        loop {
            let mut url = self.container_url(container);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("format", "json");
                if !prefix.is_empty() {
                    query.append_pair("prefix", prefix);
                }
                if let Some(delimiter) = delimiter {
                    query.append_pair("delimiter", &delimiter.to_string());
                }
                if !marker.is_empty() {
                    query.append_pair("marker", &marker);
                }
            }
            let response = self
                .request(reqwest::Method::GET, url)
                .send()
                .await
                .map_err(|e| Error::Download(format!("listing {container} failed: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::Download(format!(
                    "listing {} returned status {}",
                    container,
                    response.status()
                )));
            }
            let page: Vec<serde_json::Value> = response
                .json()
                .await
                .map_err(|e| Error::Parse(format!("listing response for {container}: {e}")))?;
            let page_len = page.len();

            for item in page {
                if let Some(subdir) = item["subdir"].as_str() {
                    marker = subdir.to_string();
                    entries.push(ObjectEntry {
                        name: subdir.to_string(),
                        is_pseudo_directory: true,
                        symlink_target: None,
                    });
                } else if let Some(name) = item["name"].as_str() {
                    marker = name.to_string();
                    entries.push(ObjectEntry {
                        name: name.to_string(),
                        is_pseudo_directory: false,
                        symlink_target: item["symlink_path"].as_str().map(normalize_symlink_path),
                    });
                }
            }

            if page_len < LISTING_PAGE_SIZE {
                return Ok(entries);
            }
        }
    }

    fn supports_symlinks(&self) -> bool {
        self.symlink_support
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_object_store_endpoint() {
        let body = json!({
            "token": {
                "catalog": [
                    {"type": "identity", "endpoints": []},
                    {"type": "object-store", "endpoints": [
                        {"interface": "internal", "region": "qa-de-1", "url": "http://internal"},
                        {"interface": "public", "region": "qa-de-1", "url": "http://public-de"},
                        {"interface": "public", "region": "qa-us-1", "url": "http://public-us"},
                    ]},
                ]
            }
        });
        assert_eq!(
            find_object_store_endpoint(&body, "qa-us-1").as_deref(),
            Some("http://public-us")
        );
        // empty region takes the first public endpoint
        assert_eq!(
            find_object_store_endpoint(&body, "").as_deref(),
            Some("http://public-de")
        );
        assert_eq!(find_object_store_endpoint(&body, "elsewhere"), None);
    }

    #[test]
    fn test_normalize_symlink_path() {
        assert_eq!(normalize_symlink_path("/v1/AUTH_x/c/a/b.txt"), "c/a/b.txt");
        assert_eq!(normalize_symlink_path("c/a/b.txt"), "c/a/b.txt");
    }

    #[test]
    fn test_encoded_object_path() {
        assert_eq!(encoded_object_path("c", "a/b.txt"), "/c/a/b.txt");
        assert_eq!(
            encoded_object_path("c", "with space/x"),
            "/c/with%20space/x"
        );
    }

    #[test]
    fn test_cache_key_covers_all_credentials() {
        let mut a = SwiftCredentials {
            auth_url: "http://keystone/v3".into(),
            user_name: "u".into(),
            user_domain_name: "ud".into(),
            project_name: "p".into(),
            project_domain_name: "pd".into(),
            password: "secret".into(),
            region_name: "r".into(),
        };
        let key_a = a.cache_key();
        a.region_name = "other".into();
        assert_ne!(key_a, a.cache_key());
    }
}
