// src/transfer.rs

//! The per-file transfer decision and upload algorithm.
//!
//! For each file the transferor decides between an immutability shortcut, a
//! symlink copy, a conditional-request skip, a plain upload, or a segmented
//! large-object upload. The target remembers the source's `Etag` and
//! `Last-Modified` as user metadata, which is what makes re-runs cheap:
//! unchanged files produce a 304 on the next run and are skipped.

use bytes::Bytes;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info};

use crate::config::{Job, SegmentingConfiguration};
use crate::error::{Error, Result};
use crate::sources::{parse_http_date, FileBody, FileSpec, FileState, GetConditions};
use crate::swift::{SegmentInfo, UploadHeaders};

/// Target metadata key holding the source's Etag
const META_SOURCE_ETAG: &str = "source-etag";
/// Target metadata key holding the source's Last-Modified timestamp
const META_SOURCE_LAST_MODIFIED: &str = "source-last-modified";

static LOG_INDIVIDUAL_TRANSFERS: AtomicBool = AtomicBool::new(false);

/// Log each successful transfer at info level (`LOG_TRANSFERS=1`)
pub fn set_log_individual_transfers(enabled: bool) {
    LOG_INDIVIDUAL_TRANSFERS.store(enabled, Ordering::Relaxed);
}

/// The outcome of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    /// The file was newer on the source and was sent to the target
    Success,
    /// The file was the same on both sides and nothing was transferred
    Skipped,
    /// An error occurred and was logged
    Failed,
}

/// A single file which is mirrored as part of a job
pub struct File {
    pub job: Arc<Job>,
    pub spec: FileSpec,
}

impl File {
    /// The object name of this file in the target container
    pub fn target_object_name(&self) -> String {
        self.job.target.object_name(&self.spec.path)
    }

    /// Transfer this file from the source to the target. Errors are logged
    /// here; the caller only sees the result classification.
    pub async fn perform_transfer(&mut self) -> (TransferResult, u64) {
        let outcome = self.transfer_inner().await;
        match outcome {
            Ok((result, bytes)) => {
                if result != TransferResult::Failed {
                    // the scrape-time buffer is consumed at most once
                    self.spec.contents = None;
                }
                (result, bytes)
            }
            Err(e) => {
                error!("{}", e);
                (TransferResult::Failed, 0)
            }
        }
    }

    async fn transfer_inner(&self) -> Result<(TransferResult, u64)> {
        let container = &self.job.target.container;
        let object_name = self.target_object_name();

        // files matching the immutable pattern are never re-checked once
        // they exist on the target; this is what lets huge package mirrors
        // re-run without a HEAD per package
        if let Some(rx) = &self.job.matcher.immutable_rx {
            if rx.is_match(&self.spec.path)
                && self
                    .job
                    .target
                    .file_exists
                    .as_ref()
                    .is_some_and(|existing| existing.contains(&object_name))
            {
                debug!("skipping {}/{}: already transferred", container, object_name);
                return Ok((TransferResult::Skipped, 0));
            }
        }

        debug!("transferring to {}/{}", container, object_name);
        let store = self.job.target.store()?;

        // symlinks are only preserved when the target server supports them
        // and the link target is itself part of this job; otherwise the
        // file is copied like a regular object
        let mut symlink_target = self.spec.symlink_target_path.clone();
        if let Some(target_path) = &symlink_target {
            let feasible = store.supports_symlinks()
                && self.job.matcher.check_recursive(target_path, None).is_none();
            if !feasible {
                symlink_target = None;
            }
        }

        // query the file metadata at the target; if we cannot even HEAD the
        // object, don't waste bandwidth downloading something we could not
        // upload anyway
        let existing = match store.head_object(container, &object_name).await {
            Ok(headers) => headers,
            Err(e) => {
                error!(
                    "skipping target {}/{}: HEAD failed: {}",
                    container, object_name, e
                );
                return Ok((TransferResult::Failed, 0));
            }
        };

        if let Some(target_path) = symlink_target {
            return self.transfer_symlink(&object_name, &target_path, existing.as_ref()).await;
        }

        // take advantage of Etag and Last-Modified where possible
        let target_metadata = existing.map(|headers| headers.metadata).unwrap_or_default();
        let conditions = GetConditions {
            if_none_match: target_metadata.get(META_SOURCE_ETAG).cloned(),
            if_modified_since: target_metadata.get(META_SOURCE_LAST_MODIFIED).cloned(),
        };

        let (body, source_state) = match &self.spec.contents {
            None => self.job.source.get_file(&self.spec, &conditions).await?,
            Some(contents) => {
                debug!("using cached contents for {}", self.spec.path);
                cached_transfer_format(&self.spec, contents.clone(), &conditions)?
            }
        };
        if source_state.skip_transfer {
            return Ok((TransferResult::Skipped, 0));
        }

        if LOG_INDIVIDUAL_TRANSFERS.load(Ordering::Relaxed) {
            info!("transferring to {}/{}", container, object_name);
        }

        // store enough source metadata to decide "unchanged" on future runs
        let mut upload_headers = UploadHeaders {
            content_type: source_state.content_type.clone(),
            ..UploadHeaders::default()
        };
        if let Some(etag) = &source_state.etag {
            upload_headers
                .metadata
                .insert(META_SOURCE_ETAG.to_string(), etag.clone());
        }
        if let Some(last_modified) = &source_state.last_modified {
            upload_headers
                .metadata
                .insert(META_SOURCE_LAST_MODIFIED.to_string(), last_modified.clone());
        }
        if self.job.expiration.enabled {
            if let Some(expiry_time) = source_state.expiry_time {
                let delay = i64::from(self.job.expiration.delay_seconds);
                upload_headers.delete_at = Some(expiry_time.timestamp() + delay);
            }
        }

        let body = body.unwrap_or_else(|| Box::new(Cursor::new(Bytes::new())));

        match &self.job.segmenting {
            Some(segmenting)
                if source_state
                    .size_bytes
                    .is_some_and(|size| size >= segmenting.min_object_size) =>
            {
                self.upload_large_object(&object_name, body, &source_state, &upload_headers, segmenting)
                    .await
            }
            _ => {
                self.upload_normal_object(&object_name, body, &source_state, &upload_headers)
                    .await
            }
        }
    }

    /// Create or replace the target object as a symlink
    async fn transfer_symlink(
        &self,
        object_name: &str,
        target_path: &str,
        existing: Option<&crate::swift::ObjectHeaders>,
    ) -> Result<(TransferResult, u64)> {
        let container = &self.job.target.container;
        let store = self.job.target.store()?;
        let link_target = format!(
            "{}/{}",
            container,
            self.job.target.object_name(target_path)
        );

        if let Some(existing) = existing {
            if existing.symlink_target.as_deref() == Some(link_target.as_str()) {
                return Ok((TransferResult::Skipped, 0));
            }
        }

        match store
            .put_symlink(container, object_name, &link_target, &UploadHeaders::default())
            .await
        {
            Ok(()) => Ok((TransferResult::Success, 0)),
            Err(e) => {
                error!("symlink PUT {}/{} failed: {}", container, object_name, e);
                // clean up a potentially incomplete upload
                if let Err(e) = store.delete_object(container, object_name).await {
                    error!("DELETE {}/{} failed: {}", container, object_name, e);
                }
                Ok((TransferResult::Failed, 0))
            }
        }
    }

    async fn upload_normal_object(
        &self,
        object_name: &str,
        body: FileBody,
        source_state: &FileState,
        upload_headers: &UploadHeaders,
    ) -> Result<(TransferResult, u64)> {
        let container = &self.job.target.container;
        let store = self.job.target.store()?;

        match store.put_object(container, object_name, upload_headers, body).await {
            Ok(_) => Ok((
                TransferResult::Success,
                source_state.size_bytes.unwrap_or(0),
            )),
            Err(Error::RateLimited(message)) => {
                // the object was definitely not written; a delete request
                // would only add to the rate limit
                error!("{} failed: rate limited", message);
                Ok((TransferResult::Failed, 0))
            }
            Err(e) => {
                error!("PUT {}/{} failed: {}", container, object_name, e);
                // delete the potentially incomplete upload
                if let Err(e) = store.delete_object(container, object_name).await {
                    error!("DELETE {}/{} failed: {}", container, object_name, e);
                }
                Ok((TransferResult::Failed, 0))
            }
        }
    }

    async fn upload_large_object(
        &self,
        object_name: &str,
        body: FileBody,
        source_state: &FileState,
        upload_headers: &UploadHeaders,
        segmenting: &SegmentingConfiguration,
    ) -> Result<(TransferResult, u64)> {
        let container = &self.job.target.container;

        // the segment prefix is unique per upload attempt, so retried or
        // concurrent uploads of the same object never collide
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let segment_prefix = format!(
            "{}/slo/{}.{:09}/{}/{}",
            object_name,
            now.as_secs(),
            now.subsec_nanos(),
            source_state.size_bytes.unwrap_or(0),
            segmenting.segment_size,
        );

        match self
            .upload_segments(object_name, body, upload_headers, segmenting, &segment_prefix)
            .await
        {
            Ok(bytes_uploaded) => {
                info!(
                    "PUT {}/{} has created a static large object with segments in {}/{}/",
                    container, object_name, segmenting.container, segment_prefix
                );
                Ok((TransferResult::Success, bytes_uploaded))
            }
            Err(e) => {
                error!(
                    "PUT {}/{} as static large object failed: {}",
                    container, object_name, e
                );
                self.cleanup_large_object(object_name, segmenting, &segment_prefix)
                    .await;
                Ok((TransferResult::Failed, 0))
            }
        }
    }

    /// Stream the body into fixed-size segments, then write the manifest.
    /// The manifest is written only after every segment is in place, which
    /// is what keeps readers from ever seeing a manifest with missing
    /// segments.
    async fn upload_segments(
        &self,
        object_name: &str,
        mut body: FileBody,
        upload_headers: &UploadHeaders,
        segmenting: &SegmentingConfiguration,
        segment_prefix: &str,
    ) -> Result<u64> {
        let store = self.job.target.store()?;
        let mut segments = Vec::new();
        let mut bytes_uploaded = 0u64;
        let mut segment_index = 0u32;

        loop {
            let chunk = read_up_to(&mut body, segmenting.segment_size)
                .await
                .map_err(|e| Error::Download(format!("read failed: {e}")))?;
            if chunk.is_empty() && segment_index > 0 {
                break;
            }

            let chunk_size = chunk.len() as u64;
            let segment_name = format!("{segment_prefix}/{segment_index:08}");
            let etag = store
                .put_object(
                    &segmenting.container,
                    &segment_name,
                    &UploadHeaders::default(),
                    Box::new(Cursor::new(chunk)),
                )
                .await?;

            segments.push(SegmentInfo {
                path: format!("{}/{}", segmenting.container, segment_name),
                etag: (!etag.is_empty()).then_some(etag),
                size_bytes: chunk_size,
            });
            bytes_uploaded += chunk_size;
            segment_index += 1;

            if chunk_size < segmenting.segment_size {
                break;
            }
        }

        store
            .put_slo_manifest(
                &self.job.target.container,
                object_name,
                upload_headers,
                &segments,
            )
            .await?;
        Ok(bytes_uploaded)
    }

    /// Remove the manifest (if written) and every segment of a failed
    /// large-object upload, so no half-uploaded state survives
    async fn cleanup_large_object(
        &self,
        object_name: &str,
        segmenting: &SegmentingConfiguration,
        segment_prefix: &str,
    ) {
        let container = &self.job.target.container;
        let Ok(store) = self.job.target.store() else {
            return;
        };

        if let Err(e) = store.delete_object(container, object_name).await {
            error!("DELETE {}/{} failed: {}", container, object_name, e);
        }

        let prefix = format!("{segment_prefix}/");
        let segment_names = match store
            .list_objects(&segmenting.container, &prefix, None)
            .await
        {
            Ok(entries) => entries.into_iter().map(|entry| entry.name).collect::<Vec<_>>(),
            Err(e) => {
                error!(
                    "cannot enumerate segments in {}/{} for cleanup: {}",
                    segmenting.container, prefix, e
                );
                return;
            }
        };
        if segment_names.is_empty() {
            return;
        }

        match store.bulk_delete(&segmenting.container, &segment_names).await {
            Ok(outcome) => {
                for (segment_name, status) in outcome.errors {
                    error!("DELETE {} failed: {}", segment_name, status);
                }
            }
            Err(e) => {
                error!(
                    "DELETE {}/{}* failed: {}",
                    segmenting.container, prefix, e
                );
            }
        }
    }
}

/// Simulate conditional-request semantics for contents that were already
/// downloaded during scraping
fn cached_transfer_format(
    spec: &FileSpec,
    contents: Bytes,
    conditions: &GetConditions,
) -> Result<(Option<FileBody>, FileState)> {
    let headers = spec.headers.clone().unwrap_or_default();
    let mut state = FileState {
        etag: headers.etag,
        last_modified: headers.last_modified,
        size_bytes: Some(contents.len() as u64),
        expiry_time: None,
        skip_transfer: false,
        content_type: headers.content_type,
    };

    if let (Some(target_etag), Some(source_etag)) = (&conditions.if_none_match, &state.etag) {
        state.skip_transfer = target_etag == source_etag;
    } else if let (Some(target_mtime), Some(source_mtime)) =
        (&conditions.if_modified_since, &state.last_modified)
    {
        let target_mtime = parse_http_date(target_mtime)
            .ok_or_else(|| Error::Parse(format!("invalid Last-Modified value: {target_mtime:?}")))?;
        let source_mtime = parse_http_date(source_mtime)
            .ok_or_else(|| Error::Parse(format!("invalid Last-Modified value: {source_mtime:?}")))?;
        state.skip_transfer = target_mtime == source_mtime;
    }

    Ok((Some(Box::new(Cursor::new(contents))), state))
}

/// Read up to `limit` bytes from the body into one buffer
async fn read_up_to(reader: &mut FileBody, limit: u64) -> std::io::Result<Bytes> {
    let mut buffer = Vec::new();
    let mut limited = (&mut *reader).take(limit);
    limited.read_to_end(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}
