// src/actors/scraper.rs

//! The scraper actor.
//!
//! Reads listings on the source side to enumerate everything that needs to
//! be transferred. Directories wait on a LIFO stack that is seeded with the
//! jobs in reverse order, so the first configured job is scraped completely
//! before the next one starts. A failing directory is pushed to the bottom
//! of the stack and retried after all other pending work, up to two more
//! times.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::report::ReportEvent;
use crate::config::Job;
use crate::sources::ListError;
use crate::transfer::File;

/// A directory on the source side which can be scraped
pub struct Directory {
    pub job: Arc<Job>,
    pub path: String,
    /// Increased every time scraping of this directory fails
    pub retry_counter: u32,
}

/// Produces `File` work items for the transferors
pub struct Scraper {
    pub jobs: Vec<Arc<Job>>,
    pub output: mpsc::Sender<File>,
    pub report: mpsc::Sender<ReportEvent>,
}

impl Scraper {
    pub async fn run(self, ctx: CancellationToken) {
        // push jobs in reverse order so that the first job is processed
        // first
        let mut stack: Vec<Directory> = Vec::with_capacity(self.jobs.len());
        for job in self.jobs.iter().rev() {
            stack.push(Directory {
                job: Arc::clone(job),
                path: "/".to_string(),
                retry_counter: 0,
            });
        }

        'outer: loop {
            if ctx.is_cancelled() {
                break;
            }
            let Some(mut directory) = stack.pop() else {
                break;
            };
            let job = Arc::clone(&directory.job);

            // at the top level, prefer ListAllFiles where the source
            // supports it
            let listing = if directory.path == "/" {
                match job.source.list_all_files().await {
                    Err(ListError::NotSupported) => job.source.list_entries("/").await,
                    other => other,
                }
            } else {
                job.source.list_entries(&directory.path).await
            };

            let entries = match listing {
                Ok(entries) => entries,
                Err(e) => {
                    let (location, message) = match e {
                        ListError::Failed { location, message } => (location, message),
                        ListError::NotSupported => {
                            (directory.path.clone(), "listing not supported".to_string())
                        }
                    };
                    if directory.retry_counter >= 2 {
                        error!("giving up on {}: {}", location, message);
                        job.is_scraping_incomplete.store(true, Ordering::Relaxed);
                        let _ = self.report.send(ReportEvent::Directory { failed: true }).await;
                        if directory.path == "/" {
                            // the whole job produced nothing
                            let _ = self.report.send(ReportEvent::JobSkipped).await;
                        }
                        continue;
                    }
                    warn!("skipping {} for now: {}", location, message);
                    directory.retry_counter += 1;
                    // bottom of the stack: retried only after every other
                    // pending directory has been attempted
                    stack.insert(0, directory);
                    continue;
                }
            };

            for entry in entries {
                if let Some(reason) = job.matcher.check_file(&entry) {
                    debug!("skipping {}: {}", entry.path, reason);
                    continue;
                }

                if entry.is_directory {
                    stack.push(Directory {
                        job: Arc::clone(&job),
                        path: entry.path,
                        retry_counter: 0,
                    });
                } else {
                    let file = File {
                        job: Arc::clone(&job),
                        spec: entry,
                    };
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break 'outer,
                        result = self.output.send(file) => {
                            if result.is_err() {
                                // all transferors are gone
                                break 'outer;
                            }
                        }
                    }
                }
            }

            let _ = self.report.send(ReportEvent::Directory { failed: false }).await;
        }

        // dropping self.output closes the channel and signals the
        // transferors that no more work is coming
    }
}
