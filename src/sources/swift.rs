// src/sources/swift.rs

//! Swift containers as source and target locations.
//!
//! The same location type serves both sides of a job: as a source it
//! enumerates and fetches objects, as a target it is the container the
//! transfer engine uploads into. Credentials missing on a location are
//! inherited from the global `swift` configuration block.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{FileBody, FileSpec, FileState, GetConditions, ListError, Source};
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::swift::{self, GetOutcome, ObjectStore, SwiftCredentials};

/// A Swift container, usable as a source and as a target
#[derive(Clone, Default, Deserialize)]
pub struct SwiftLocation {
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_domain_name: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_domain_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub region_name: String,
    #[serde(default)]
    pub container: String,
    #[serde(default, rename = "object_prefix")]
    pub object_name_prefix: String,

    /// The global `swift` block has no container; job locations require one
    #[serde(skip)]
    pub validate_ignore_empty_container: bool,
    /// Filled by `connect`
    #[serde(skip)]
    pub store: Option<Arc<dyn ObjectStore>>,
    /// Filled by `discover_existing_files`; keys are full object names
    /// including the prefix
    #[serde(skip)]
    pub file_exists: Option<HashSet<String>>,
}

impl SwiftLocation {
    /// Report missing required credentials
    pub fn validate(&self, name: &str) -> Vec<Error> {
        let mut errors = Vec::new();
        let mut require = |field: &str, value: &str| {
            if value.is_empty() {
                errors.push(Error::Config(format!("missing value for {name}.{field}")));
            }
        };
        require("auth_url", &self.auth_url);
        require("user_name", &self.user_name);
        require("user_domain_name", &self.user_domain_name);
        require("project_name", &self.project_name);
        require("project_domain_name", &self.project_domain_name);
        require("password", &self.password);
        if !self.validate_ignore_empty_container {
            require("container", &self.container);
        }
        errors
    }

    /// Fill empty credential fields from the global `swift` block
    pub fn inherit_credentials(&mut self, global: &SwiftLocation) {
        let fill = |target: &mut String, source: &String| {
            if target.is_empty() {
                target.clone_from(source);
            }
        };
        fill(&mut self.auth_url, &global.auth_url);
        fill(&mut self.user_name, &global.user_name);
        fill(&mut self.user_domain_name, &global.user_domain_name);
        fill(&mut self.project_name, &global.project_name);
        fill(&mut self.project_domain_name, &global.project_domain_name);
        fill(&mut self.password, &global.password);
        fill(&mut self.region_name, &global.region_name);
    }

    fn credentials(&self) -> SwiftCredentials {
        SwiftCredentials {
            auth_url: self.auth_url.clone(),
            user_name: self.user_name.clone(),
            user_domain_name: self.user_domain_name.clone(),
            project_name: self.project_name.clone(),
            project_domain_name: self.project_domain_name.clone(),
            password: self.password.clone(),
            region_name: self.region_name.clone(),
        }
    }

    /// Authenticate (re-using cached connections for shared credentials) and
    /// create the container if it is missing
    pub async fn connect(&mut self, http: &reqwest::Client) -> Result<()> {
        if self.store.is_none() {
            let client: Arc<dyn ObjectStore> = swift::connect(&self.credentials(), http).await?;
            self.store = Some(client);
        }
        if !self.container.is_empty() {
            self.ensure_container_exists(&self.container).await?;
        }
        Ok(())
    }

    /// Create the given container in this account if it does not exist yet
    pub async fn ensure_container_exists(&self, container: &str) -> Result<()> {
        self.store()?.create_container(container).await
    }

    /// The connected object store handle
    pub fn store(&self) -> Result<&Arc<dyn ObjectStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Config("Swift location used before connect".to_string()))
    }

    /// Full object name for a source-relative path
    pub fn object_name(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.object_name_prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.object_name_prefix.trim_end_matches('/'), path)
        }
    }

    fn listing_prefix(&self) -> String {
        if self.object_name_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.object_name_prefix.trim_end_matches('/'))
        }
    }

    /// Find all objects that currently exist below the prefix and record
    /// those the matcher considers part of this job. Called once during job
    /// compilation; the resulting set is read-only afterwards.
    pub async fn discover_existing_files(&mut self, matcher: &Matcher) -> Result<()> {
        let prefix = self.listing_prefix();
        let entries = self
            .store()?
            .list_objects(&self.container, &prefix, None)
            .await?;

        let mut file_exists = HashSet::with_capacity(entries.len());
        for entry in entries {
            let path_for_matching = entry.name.strip_prefix(&prefix).unwrap_or(&entry.name);
            if matcher.check_recursive(path_for_matching, None).is_none() {
                file_exists.insert(entry.name);
            }
        }
        debug!(
            "found {} existing objects in {}/{}",
            file_exists.len(),
            self.container,
            prefix
        );
        self.file_exists = Some(file_exists);
        Ok(())
    }

    /// Normalize a listing symlink target (`container/object`) into a path
    /// relative to this location, or `None` if the target lies outside it
    fn relative_symlink_target(&self, target: &str) -> Option<String> {
        let (container, object) = target.split_once('/')?;
        if container != self.container {
            return None;
        }
        let prefix = self.listing_prefix();
        object.strip_prefix(prefix.as_str()).map(str::to_string)
    }
}

#[async_trait]
impl Source for SwiftLocation {
    fn validate(&mut self, name: &str) -> Vec<Error> {
        SwiftLocation::validate(self, name)
    }

    async fn connect(&mut self) -> Result<()> {
        let http = super::http::default_client()?;
        SwiftLocation::connect(self, &http).await
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        let prefix = self.listing_prefix();
        let entries = self
            .store()
            .map_err(|e| ListError::failed(&self.container, e.to_string()))?
            .list_objects(&self.container, &prefix, None)
            .await
            .map_err(|e| {
                ListError::failed(format!("{}/{}", self.container, prefix), e.to_string())
            })?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let path = entry
                    .name
                    .strip_prefix(&prefix)
                    .unwrap_or(&entry.name)
                    .to_string();
                let symlink_target_path = entry
                    .symlink_target
                    .as_deref()
                    .and_then(|target| self.relative_symlink_target(target));
                FileSpec {
                    path,
                    symlink_target_path,
                    ..FileSpec::default()
                }
            })
            .collect())
    }

    async fn list_entries(
        &self,
        directory_path: &str,
    ) -> std::result::Result<Vec<FileSpec>, ListError> {
        let directory = directory_path.trim_matches('/');
        let mut prefix = self.listing_prefix();
        if !directory.is_empty() {
            prefix.push_str(directory);
            prefix.push('/');
        }
        debug!("listing objects at {}/{}", self.container, prefix);

        let entries = self
            .store()
            .map_err(|e| ListError::failed(&self.container, e.to_string()))?
            .list_objects(&self.container, &prefix, Some('/'))
            .await
            .map_err(|e| {
                ListError::failed(format!("{}/{}", self.container, prefix), e.to_string())
            })?;

        let location_prefix = self.listing_prefix();
        Ok(entries
            .into_iter()
            .map(|entry| {
                let path = entry
                    .name
                    .strip_prefix(&location_prefix)
                    .unwrap_or(&entry.name)
                    .trim_end_matches('/')
                    .to_string();
                FileSpec {
                    path,
                    is_directory: entry.is_pseudo_directory,
                    ..FileSpec::default()
                }
            })
            .collect())
    }

    async fn get_file(
        &self,
        spec: &FileSpec,
        conditions: &GetConditions,
    ) -> Result<(Option<FileBody>, FileState)> {
        let object_name = self.object_name(&spec.path);
        let outcome = self
            .store()?
            .get_object(&self.container, &object_name, conditions)
            .await?;

        match outcome {
            GetOutcome::NotModified => Ok((
                None,
                FileState {
                    skip_transfer: true,
                    ..FileState::default()
                },
            )),
            GetOutcome::Found { body, headers } => {
                let expiry_time = headers
                    .delete_at
                    .and_then(|unix| Utc.timestamp_opt(unix, 0).single());
                Ok((
                    Some(body),
                    FileState {
                        etag: headers.etag,
                        last_modified: headers.last_modified,
                        size_bytes: headers.content_length,
                        expiry_time,
                        skip_transfer: false,
                        content_type: headers.content_type,
                    },
                ))
            }
        }
    }
}
