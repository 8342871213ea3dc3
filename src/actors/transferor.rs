// src/actors/transferor.rs

//! The transferor actor.
//!
//! Each transfer worker drains `File` work items from the shared input
//! channel and performs the transfers. A file that fails is retried once at
//! the end of the run; only the outcome of that second attempt counts. On
//! cancellation the worker switches to drain mode, reading and discarding
//! input so that the scraper never deadlocks on a full queue.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::cleaner::FileInfoForCleaner;
use super::report::ReportEvent;
use crate::transfer::{File, TransferResult};

/// Performs transfers for files read from the shared input channel
pub struct Transferor {
    pub input: Arc<Mutex<mpsc::Receiver<File>>>,
    pub output: mpsc::Sender<FileInfoForCleaner>,
    pub report: mpsc::Sender<ReportEvent>,
}

impl Transferor {
    pub async fn run(self, ctx: CancellationToken) {
        let mut retry_files: Vec<File> = Vec::new();
        let mut aborted = false;

        loop {
            if ctx.is_cancelled() {
                aborted = true;
                break;
            }

            let next = {
                let mut receiver = self.input.lock().await;
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        aborted = true;
                        break;
                    }
                    file = receiver.recv() => file,
                }
            };
            let Some(mut file) = next else {
                break;
            };

            let (result, bytes) = file.perform_transfer().await;
            if result == TransferResult::Failed {
                // not reported yet; the retry pass decides the final outcome
                retry_files.push(file);
                continue;
            }
            self.publish(&file, result, bytes, false).await;
        }

        if aborted {
            // drain the input so the scraper does not block on a full queue
            loop {
                let next = self.input.lock().await.recv().await;
                if next.is_none() {
                    break;
                }
            }
            return;
        }

        // retry pass: one more attempt for every file that failed
        for mut file in retry_files {
            if ctx.is_cancelled() {
                break;
            }
            let (result, bytes) = file.perform_transfer().await;
            self.publish(&file, result, bytes, result == TransferResult::Failed)
                .await;
        }
    }

    async fn publish(&self, file: &File, result: TransferResult, bytes: u64, failed: bool) {
        let info = FileInfoForCleaner {
            job: Arc::clone(&file.job),
            object_name: file.target_object_name(),
            failed,
        };
        let _ = self.output.send(info).await;
        let _ = self.report.send(ReportEvent::File { result, bytes }).await;
    }
}
