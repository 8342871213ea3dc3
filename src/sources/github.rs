// src/sources/github.rs

//! GitHub release assets as a source.
//!
//! Releases are enumerated through the JSON API (paginated via the `Link`
//! header); each asset of each accepted release becomes one file named
//! `<tag>/<asset>`. Assets are addressed by their API ID rather than by
//! path, so the specs carry a `download_path`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use std::sync::LazyLock;

use super::http::default_client;
use super::{FileBody, FileSpec, FileState, GetConditions, ListError, Source};
use crate::error::{Error, Result};

/// API version sent with every request, as GitHub recommends
const API_VERSION: &str = "2022-11-28";

/// Results per page; higher than the default of 30 to stay below the API
/// rate limit on repositories with many releases
const RELEASES_PER_PAGE: u32 = 50;

/// Extracts owner and repository from the path of a repository URL
static GITHUB_REPO_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([^\s/]+)/([^\s/]+)/?$").expect("static regex"));

/// A source that mirrors the release assets of one GitHub repository
#[derive(Clone, Default, Deserialize)]
pub struct GithubReleaseSource {
    #[serde(rename = "url")]
    pub url_string: String,
    /// Bearer token; required for GitHub Enterprise hosts
    #[serde(default)]
    pub token: String,
    /// Only mirror releases whose tag matches this pattern
    #[serde(default)]
    pub tag_name_pattern: String,
    #[serde(default)]
    pub include_draft: bool,
    #[serde(default)]
    pub include_prerelease: bool,

    #[serde(skip)]
    url: Option<Url>,
    #[serde(skip)]
    api_base: Option<Url>,
    #[serde(skip)]
    owner: String,
    #[serde(skip)]
    repo: String,
    #[serde(skip)]
    tag_name_rx: Option<Regex>,
    /// Stops release pagination early; inherited from the job's
    /// `match.not_older_than` setting at compile time
    #[serde(skip)]
    pub not_older_than: Option<DateTime<Utc>>,
    #[serde(skip)]
    client: Option<reqwest::Client>,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    id: i64,
    name: String,
    updated_at: Option<DateTime<Utc>>,
    browser_download_url: Option<String>,
}

impl GithubReleaseSource {
    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Config("GitHub source used before connect".to_string()))
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        self.api_base
            .as_ref()
            .ok_or_else(|| Error::Config("GitHub source used before connect".to_string()))?
            .join(path)
            .map_err(|e| Error::Config(format!("cannot build API URL for {path:?}: {e}")))
    }

    fn api_request(&self, url: Url) -> Result<reqwest::RequestBuilder> {
        let mut request = self
            .client()?
            .get(url)
            .header("X-GitHub-Api-Version", API_VERSION);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.token));
        }
        Ok(request)
    }

    fn accepts_release(&self, release: &Release) -> bool {
        if release.draft && !self.include_draft {
            return false;
        }
        if release.prerelease && !self.include_prerelease {
            return false;
        }
        if let Some(rx) = &self.tag_name_rx {
            if !rx.is_match(&release.tag_name) {
                return false;
            }
        }
        true
    }

    async fn get_releases(&self) -> Result<Vec<Release>> {
        let mut releases = Vec::new();
        let mut next_url = Some(self.api_url(&format!(
            "repos/{}/{}/releases?per_page={}",
            self.owner, self.repo, RELEASES_PER_PAGE
        ))?);

        while let Some(url) = next_url.take() {
            let response = self
                .api_request(url)?
                .send()
                .await
                .map_err(|e| Error::Download(format!("could not list releases: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::Download(format!(
                    "could not list releases: got status {}",
                    response.status()
                )));
            }

            next_url = response
                .headers()
                .get("link")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_link_next)
                .and_then(|target| Url::parse(&target).ok());

            let page: Vec<Release> = response
                .json()
                .await
                .map_err(|e| Error::Parse(format!("release listing: {e}")))?;
            releases.extend(page);

            // once the last release on a page is older than the cutoff,
            // further pages can only contain older ones
            if let (Some(cutoff), Some(last)) = (self.not_older_than, releases.last()) {
                if let Some(published_at) = last.published_at {
                    if cutoff > published_at {
                        break;
                    }
                }
            }
        }

        Ok(releases)
    }
}

#[async_trait]
impl Source for GithubReleaseSource {
    fn validate(&mut self, name: &str) -> Vec<Error> {
        let url = match Url::parse(&self.url_string) {
            Ok(url) => url,
            Err(e) => {
                return vec![Error::Config(format!("could not parse {name}.url: {e}"))];
            }
        };

        let invalid_url = || {
            Error::Config(format!(
                "invalid value for {}.url: expected a url in the format {:?}, got: {:?}",
                name, "http(s)://<hostname>/<owner>/<repo>", self.url_string
            ))
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return vec![invalid_url()];
        }
        if url.query().is_some() || url.fragment().is_some() {
            return vec![invalid_url()];
        }
        let Some(captures) = GITHUB_REPO_RX.captures(url.path()) else {
            return vec![invalid_url()];
        };
        self.owner = captures[1].to_string();
        self.repo = captures[2].to_string();

        if url.host_str() != Some("github.com") && self.token.is_empty() {
            return vec![Error::Config(format!(
                "{name}.token is required for repositories hosted on GitHub Enterprise"
            ))];
        }

        if !self.tag_name_pattern.is_empty() {
            match Regex::new(&self.tag_name_pattern) {
                Ok(rx) => self.tag_name_rx = Some(rx),
                Err(e) => {
                    return vec![Error::Config(format!(
                        "could not parse {name}.tag_name_pattern: {e}"
                    ))];
                }
            }
        }

        self.url = Some(url);
        Vec::new()
    }

    async fn connect(&mut self) -> Result<()> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| Error::Config("GitHub source used before validate".to_string()))?;

        self.api_base = Some(if url.host_str() == Some("github.com") {
            Url::parse("https://api.github.com/").expect("static URL")
        } else {
            let mut base = url.clone();
            base.set_path("/api/v3/");
            base
        });
        self.client = Some(default_client()?);
        Ok(())
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        let location = self.url_string.clone();
        let releases = self
            .get_releases()
            .await
            .map_err(|e| ListError::failed(&location, e.to_string()))?;

        let mut result = Vec::new();
        for release in releases {
            if !self.accepts_release(&release) {
                continue;
            }
            for asset in release.assets {
                if asset.browser_download_url.is_none() {
                    continue;
                }
                result.push(FileSpec {
                    path: format!("{}/{}", release.tag_name, asset.name),
                    download_path: Some(asset.id.to_string()),
                    last_modified: asset.updated_at,
                    ..FileSpec::default()
                });
            }
        }
        Ok(result)
    }

    async fn list_entries(
        &self,
        _directory_path: &str,
    ) -> std::result::Result<Vec<FileSpec>, ListError> {
        Err(ListError::NotSupported)
    }

    async fn get_file(
        &self,
        spec: &FileSpec,
        conditions: &GetConditions,
    ) -> Result<(Option<FileBody>, FileState)> {
        let asset_id = spec.download_path.as_deref().ok_or_else(|| {
            Error::Download(format!("release asset {} carries no asset ID", spec.path))
        })?;
        let url = self.api_url(&format!(
            "repos/{}/{}/releases/assets/{}",
            self.owner, self.repo, asset_id
        ))?;

        let mut request = self
            .api_request(url.clone())?
            .header("Accept", "application/octet-stream");
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
        // as per the GitHub docs, clients should also handle a 302 redirect
        // to the asset blob (reqwest follows it transparently)
        if status != StatusCode::OK
            && status != StatusCode::FOUND
            && status != StatusCode::NOT_MODIFIED
        {
            return Err(Error::Download(format!(
                "skipping {url}: GET returned unexpected status code: expected one of [200, 302, 304] but got {}",
                status.as_u16()
            )));
        }

        let state = state_from_response(&response);
        if state.skip_transfer {
            return Ok((None, state));
        }
        Ok((Some(super::http::stream_body(response)), state))
    }
}

fn state_from_response(response: &Response) -> FileState {
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

/// Extract the `rel="next"` target from a `Link` response header
fn parse_link_next(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let Some((target, params)) = part.split_once(';') else {
            continue;
        };
        if params.split(';').any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        }) {
            return Some(
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            );
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str, token: &str) -> GithubReleaseSource {
        GithubReleaseSource {
            url_string: url.to_string(),
            token: token.to_string(),
            ..GithubReleaseSource::default()
        }
    }

    #[test]
    fn test_validate_extracts_owner_and_repo() {
        let mut s = source("https://github.com/sapcc/swift-mirror", "");
        assert!(Source::validate(&mut s, "jobs[0].from").is_empty());
        assert_eq!(s.owner, "sapcc");
        assert_eq!(s.repo, "swift-mirror");
    }

    #[test]
    fn test_validate_rejects_malformed_urls() {
        for url in [
            "https://github.com/onlyowner",
            "https://github.com/a/b/c",
            "ftp://github.com/a/b",
            "https://github.com/a/b?x=1",
        ] {
            let mut s = source(url, "");
            assert!(!Source::validate(&mut s, "jobs[0].from").is_empty(), "{url}");
        }
    }

    #[test]
    fn test_validate_requires_token_for_enterprise() {
        let mut s = source("https://github.example.com/a/b", "");
        let errors = Source::validate(&mut s, "jobs[0].from");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("token"));

        let mut s = source("https://github.example.com/a/b", "ghp_secret");
        assert!(Source::validate(&mut s, "jobs[0].from").is_empty());
    }

    #[test]
    fn test_accepts_release() {
        let mut s = source("https://github.com/a/b", "");
        s.tag_name_pattern = r"^v1\.".to_string();
        assert!(Source::validate(&mut s, "jobs[0].from").is_empty());

        let release = |tag: &str, draft: bool, prerelease: bool| Release {
            tag_name: tag.to_string(),
            draft,
            prerelease,
            published_at: None,
            assets: Vec::new(),
        };
        assert!(s.accepts_release(&release("v1.2.0", false, false)));
        assert!(!s.accepts_release(&release("v2.0.0", false, false)));
        assert!(!s.accepts_release(&release("v1.2.0", true, false)));
        assert!(!s.accepts_release(&release("v1.2.0", false, true)));
    }

    #[test]
    fn test_parse_link_next() {
        let header = "<https://api.github.com/repos/a/b/releases?page=4>; rel=\"next\", \
                      <https://api.github.com/repos/a/b/releases?page=9>; rel=\"last\"";
        assert_eq!(
            parse_link_next(header).as_deref(),
            Some("https://api.github.com/repos/a/b/releases?page=4")
        );
        assert_eq!(
            parse_link_next("<https://x.example.com/p?page=1>; rel=\"prev\""),
            None
        );
        assert_eq!(parse_link_next(""), None);
    }
}
