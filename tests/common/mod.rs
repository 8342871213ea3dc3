// tests/common/mod.rs

//! Shared test doubles for pipeline-level tests: an in-memory object store
//! and a scriptable source.

// not every test binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

use swift_mirror::config::{
    CleanupConfiguration, ExpirationConfiguration, Job, SegmentingConfiguration,
};
use swift_mirror::matcher::Matcher;
use swift_mirror::sources::swift::SwiftLocation;
use swift_mirror::sources::{
    FileBody, FileSpec, FileState, GetConditions, ListError, Source,
};
use swift_mirror::swift::{
    BulkDeleteOutcome, GetOutcome, ObjectBody, ObjectEntry, ObjectHeaders, ObjectStore,
    SegmentInfo, UploadHeaders,
};
use swift_mirror::{Error, Result};

// =============================================================================
// In-memory object store
// =============================================================================

#[derive(Debug, Default, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub delete_at: Option<i64>,
    pub symlink_target: Option<String>,
}

#[derive(Default)]
pub struct StoreState {
    pub containers: HashSet<String>,
    /// (container, object name) -> object; BTreeMap keeps listings sorted
    pub objects: BTreeMap<(String, String), StoredObject>,
    /// PUTs whose object name contains one of these strings fail
    pub failing_puts: Vec<String>,
    /// PUTs whose object name contains one of these strings are rate-limited
    pub rate_limited_puts: Vec<String>,
    pub head_count: HashMap<String, u64>,
    pub put_count: HashMap<String, u64>,
}

/// An `ObjectStore` kept entirely in memory
#[derive(Default)]
pub struct InMemoryStore {
    pub state: Mutex<StoreState>,
    pub symlink_support: bool,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_symlink_support() -> Arc<Self> {
        Arc::new(Self {
            symlink_support: true,
            ..Self::default()
        })
    }

    pub fn object(&self, container: &str, name: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(container.to_string(), name.to_string()))
            .cloned()
    }

    pub fn insert_object(&self, container: &str, name: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(container.to_string());
        state.objects.insert(
            (container.to_string(), name.to_string()),
            StoredObject {
                data: data.to_vec(),
                etag: etag_of(data),
                ..StoredObject::default()
            },
        );
    }

    pub fn object_names(&self, container: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn fail_puts_containing(&self, fragment: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_puts
            .push(fragment.to_string());
    }

    pub fn head_count(&self, name: &str) -> u64 {
        *self
            .state
            .lock()
            .unwrap()
            .head_count
            .get(name)
            .unwrap_or(&0)
    }

    pub fn put_count(&self, name: &str) -> u64 {
        *self
            .state
            .lock()
            .unwrap()
            .put_count
            .get(name)
            .unwrap_or(&0)
    }
}

pub fn etag_of(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn headers_of(object: &StoredObject) -> ObjectHeaders {
    ObjectHeaders {
        etag: Some(object.etag.clone()),
        last_modified: None,
        content_type: object.content_type.clone(),
        content_length: Some(object.data.len() as u64),
        delete_at: object.delete_at,
        symlink_target: object.symlink_target.clone(),
        metadata: object.metadata.clone(),
    }
}

async fn read_body(mut body: ObjectBody) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    body.read_to_end(&mut data).await?;
    Ok(data)
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn create_container(&self, container: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container.to_string());
        Ok(())
    }

    async fn head_object(&self, container: &str, name: &str) -> Result<Option<ObjectHeaders>> {
        let mut state = self.state.lock().unwrap();
        *state.head_count.entry(name.to_string()).or_default() += 1;
        Ok(state
            .objects
            .get(&(container.to_string(), name.to_string()))
            .map(headers_of))
    }

    async fn get_object(
        &self,
        container: &str,
        name: &str,
        conditions: &GetConditions,
    ) -> Result<GetOutcome> {
        let object = self
            .object(container, name)
            .ok_or_else(|| Error::Download(format!("no such object: {container}/{name}")))?;
        if conditions.if_none_match.as_deref() == Some(object.etag.as_str()) {
            return Ok(GetOutcome::NotModified);
        }
        let headers = headers_of(&object);
        Ok(GetOutcome::Found {
            body: Box::new(Cursor::new(object.data)),
            headers,
        })
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        headers: &UploadHeaders,
        body: ObjectBody,
    ) -> Result<String> {
        let data = read_body(body)
            .await
            .map_err(|e| Error::Upload(format!("read failed: {e}")))?;

        let mut state = self.state.lock().unwrap();
        *state.put_count.entry(name.to_string()).or_default() += 1;
        if state.rate_limited_puts.iter().any(|f| name.contains(f.as_str())) {
            return Err(Error::RateLimited(format!("PUT {container}/{name}")));
        }
        if state.failing_puts.iter().any(|f| name.contains(f.as_str())) {
            return Err(Error::Upload(format!(
                "PUT {container}/{name} returned status 500"
            )));
        }

        let etag = etag_of(&data);
        state.objects.insert(
            (container.to_string(), name.to_string()),
            StoredObject {
                data,
                etag: etag.clone(),
                content_type: headers.content_type.clone(),
                metadata: headers.metadata.clone(),
                delete_at: headers.delete_at,
                symlink_target: None,
            },
        );
        Ok(etag)
    }

    async fn put_symlink(
        &self,
        container: &str,
        name: &str,
        target: &str,
        headers: &UploadHeaders,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(
            (container.to_string(), name.to_string()),
            StoredObject {
                symlink_target: Some(target.to_string()),
                content_type: headers.content_type.clone(),
                metadata: headers.metadata.clone(),
                ..StoredObject::default()
            },
        );
        Ok(())
    }

    async fn put_slo_manifest(
        &self,
        container: &str,
        name: &str,
        headers: &UploadHeaders,
        segments: &[SegmentInfo],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // a manifest referencing missing segments must never be written
        let mut data = Vec::new();
        for segment in segments {
            let (segment_container, segment_name) = segment
                .path
                .split_once('/')
                .ok_or_else(|| Error::Upload(format!("bad segment path: {}", segment.path)))?;
            let stored = state
                .objects
                .get(&(segment_container.to_string(), segment_name.to_string()))
                .ok_or_else(|| Error::Upload(format!("missing segment: {}", segment.path)))?;
            data.extend_from_slice(&stored.data);
        }
        let etag = etag_of(&data);
        state.objects.insert(
            (container.to_string(), name.to_string()),
            StoredObject {
                data,
                etag,
                content_type: headers.content_type.clone(),
                metadata: headers.metadata.clone(),
                delete_at: headers.delete_at,
                symlink_target: None,
            },
        );
        Ok(())
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&(container.to_string(), name.to_string()));
        Ok(())
    }

    async fn bulk_delete(&self, container: &str, names: &[String]) -> Result<BulkDeleteOutcome> {
        let mut state = self.state.lock().unwrap();
        let mut outcome = BulkDeleteOutcome::default();
        for name in names {
            if state
                .objects
                .remove(&(container.to_string(), name.clone()))
                .is_some()
            {
                outcome.deleted += 1;
            }
        }
        Ok(outcome)
    }

    async fn list_objects(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<ObjectEntry>> {
        let state = self.state.lock().unwrap();
        let names = state
            .objects
            .keys()
            .filter(|(c, name)| c == container && name.starts_with(prefix))
            .map(|(_, name)| name.clone());

        let mut entries = Vec::new();
        let mut seen_prefixes = HashSet::new();
        for name in names {
            match delimiter {
                Some(delimiter) => {
                    let rest = &name[prefix.len()..];
                    match rest.find(delimiter) {
                        Some(position) => {
                            let pseudo = format!("{}{}/", prefix, &rest[..position]);
                            if seen_prefixes.insert(pseudo.clone()) {
                                entries.push(ObjectEntry {
                                    name: pseudo,
                                    is_pseudo_directory: true,
                                    symlink_target: None,
                                });
                            }
                        }
                        None => entries.push(ObjectEntry {
                            name: name.clone(),
                            is_pseudo_directory: false,
                            symlink_target: state
                                .objects
                                .get(&(container.to_string(), name.clone()))
                                .and_then(|o| o.symlink_target.clone()),
                        }),
                    }
                }
                None => entries.push(ObjectEntry {
                    name: name.clone(),
                    is_pseudo_directory: false,
                    symlink_target: state
                        .objects
                        .get(&(container.to_string(), name.clone()))
                        .and_then(|o| o.symlink_target.clone()),
                }),
            }
        }
        Ok(entries)
    }

    fn supports_symlinks(&self) -> bool {
        self.symlink_support
    }
}

// =============================================================================
// Mock source
// =============================================================================

#[derive(Debug, Clone)]
pub struct MockFile {
    pub path: String,
    pub body: Vec<u8>,
    pub etag: String,
    pub last_modified: Option<String>,
    pub symlink_target: Option<String>,
}

impl MockFile {
    pub fn new(path: &str, body: &[u8], etag: &str) -> Self {
        Self {
            path: path.to_string(),
            body: body.to_vec(),
            etag: etag.to_string(),
            last_modified: None,
            symlink_target: None,
        }
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            body: Vec::new(),
            etag: String::new(),
            last_modified: None,
            symlink_target: Some(target.to_string()),
        }
    }
}

/// A source serving a fixed file list from memory
#[derive(Default)]
pub struct MockSource {
    pub files: Vec<MockFile>,
    get_counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl MockSource {
    pub fn new(files: Vec<MockFile>) -> Self {
        Self {
            files,
            get_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shared handle to the per-path GET counters; remains usable after the
    /// source has been moved into a job
    pub fn counters(&self) -> Arc<Mutex<HashMap<String, u64>>> {
        Arc::clone(&self.get_counts)
    }
}

#[async_trait]
impl Source for MockSource {
    fn validate(&mut self, _name: &str) -> Vec<Error> {
        Vec::new()
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        Ok(self
            .files
            .iter()
            .map(|file| FileSpec {
                path: file.path.clone(),
                symlink_target_path: file.symlink_target.clone(),
                ..FileSpec::default()
            })
            .collect())
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
        *self
            .get_counts
            .lock()
            .unwrap()
            .entry(spec.path.clone())
            .or_default() += 1;

        let file = self
            .files
            .iter()
            .find(|file| file.path == spec.path)
            .ok_or_else(|| Error::Download(format!("no such file: {}", spec.path)))?;

        if conditions.if_none_match.as_deref() == Some(file.etag.as_str()) {
            return Ok((
                None,
                FileState {
                    skip_transfer: true,
                    ..FileState::default()
                },
            ));
        }

        Ok((
            Some(Box::new(Cursor::new(Bytes::from(file.body.clone())))),
            FileState {
                etag: Some(file.etag.clone()),
                last_modified: file.last_modified.clone(),
                size_bytes: Some(file.body.len() as u64),
                expiry_time: None,
                skip_transfer: false,
                content_type: Some("application/octet-stream".to_string()),
            },
        ))
    }
}

// =============================================================================
// Job construction
// =============================================================================

pub struct JobBuilder {
    pub source: Box<dyn Source>,
    pub store: Arc<InMemoryStore>,
    pub container: String,
    pub matcher: Matcher,
    pub segmenting: Option<SegmentingConfiguration>,
    pub cleanup: CleanupConfiguration,
}

impl JobBuilder {
    pub fn new(source: Box<dyn Source>, store: &Arc<InMemoryStore>, container: &str) -> Self {
        Self {
            source,
            store: Arc::clone(store),
            container: container.to_string(),
            matcher: Matcher::default(),
            segmenting: None,
            cleanup: CleanupConfiguration::default(),
        }
    }

    /// Build the job, discovering existing target files the way job
    /// compilation does
    pub async fn build(self) -> Arc<Job> {
        let store: Arc<dyn ObjectStore> = self.store;
        let mut target = SwiftLocation {
            container: self.container,
            store: Some(store),
            ..SwiftLocation::default()
        };
        target
            .discover_existing_files(&self.matcher)
            .await
            .expect("listing an in-memory store cannot fail");

        Arc::new(Job {
            source: self.source,
            target,
            matcher: self.matcher,
            segmenting: self.segmenting,
            expiration: ExpirationConfiguration::default(),
            cleanup: self.cleanup,
            is_scraping_incomplete: AtomicBool::new(false),
        })
    }
}
