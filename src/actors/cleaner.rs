// src/actors/cleaner.rs

//! The cleaner actor.
//!
//! Collects the set of target objects produced by this run, and once all
//! transferors are done, removes (or reports) the objects on the target
//! that no source knows about. A job is only cleaned when every one of its
//! transfers succeeded and its scrape was complete; anything else could
//! wrongly classify objects as unknown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::report::ReportEvent;
use crate::config::{CleanupStrategy, Job};

/// Information about one transferred file, for the cleaner
pub struct FileInfoForCleaner {
    pub job: Arc<Job>,
    /// Target object name, including any prefix
    pub object_name: String,
    pub failed: bool,
}

struct JobCleanupState {
    job: Arc<Job>,
    failed: bool,
    transferred: HashSet<String>,
}

/// Cleans up unknown objects on the target side
pub struct Cleaner {
    pub input: mpsc::Receiver<FileInfoForCleaner>,
    pub report: mpsc::Sender<ReportEvent>,
}

impl Cleaner {
    pub async fn run(mut self, ctx: CancellationToken) {
        // collect information about transferred files from the transferors
        // (no cancellation check needed here: on interrupt the transferors
        // drain and close our input, and we move on)
        let mut states: HashMap<usize, JobCleanupState> = HashMap::new();
        while let Some(info) = self.input.recv().await {
            // ignore jobs without cleanup configured
            if info.job.cleanup.strategy == CleanupStrategy::Keep {
                continue;
            }
            let state = states
                .entry(Arc::as_ptr(&info.job) as usize)
                .or_insert_with(|| JobCleanupState {
                    job: Arc::clone(&info.job),
                    failed: false,
                    transferred: HashSet::new(),
                });
            if info.failed {
                state.failed = true;
            }
            state.transferred.insert(info.object_name);
        }
        if ctx.is_cancelled() {
            info!("skipping cleanup phase: interrupt was received");
            return;
        }

        // an incomplete scrape counts as a failed job; this flag is safe to
        // read now because the scraper has exited
        let mut failed_jobs = 0;
        for state in states.values_mut() {
            if state.job.is_scraping_incomplete.load(Ordering::Relaxed) {
                state.failed = true;
            }
            if state.failed {
                failed_jobs += 1;
            }
        }
        if failed_jobs > 0 {
            info!(
                "skipping cleanup phase for {} job(s) because of failed file transfers",
                failed_jobs
            );
        }

        for state in states.values() {
            if ctx.is_cancelled() {
                return;
            }
            if !state.failed {
                self.perform_cleanup(state).await;
            }
        }
    }

    async fn perform_cleanup(&self, state: &JobCleanupState) {
        let job = &state.job;
        let Some(existing) = &job.target.file_exists else {
            return;
        };

        // stable output: unknown objects in lexicographic order
        let mut unknown: Vec<String> = existing
            .iter()
            .filter(|name| !state.transferred.contains(*name))
            .cloned()
            .collect();
        unknown.sort();

        info!("starting cleanup of {} objects on target side", unknown.len());
        if unknown.is_empty() {
            return;
        }

        match job.cleanup.strategy {
            CleanupStrategy::Keep => {}
            CleanupStrategy::Report => {
                for name in &unknown {
                    info!(
                        "found unknown object on target side: {}/{}",
                        job.target.container, name
                    );
                }
            }
            CleanupStrategy::Delete => {
                let store = match job.target.store() {
                    Ok(store) => store,
                    Err(e) => {
                        error!("cleanup of {} objects failed: {}", unknown.len(), e);
                        return;
                    }
                };
                match store.bulk_delete(&job.target.container, &unknown).await {
                    Ok(outcome) => {
                        let _ = self
                            .report
                            .send(ReportEvent::Cleanup {
                                count: outcome.deleted,
                            })
                            .await;
                        for (name, status) in outcome.errors {
                            error!("DELETE {} failed: {}", name, status);
                        }
                    }
                    Err(e) => {
                        error!(
                            "cleanup of {} objects on target side failed: {}",
                            unknown.len(),
                            e
                        );
                    }
                }
            }
        }
    }
}
