// src/actors/mod.rs

//! The pipeline actors.
//!
//! A run is a fixed DAG of long-lived tasks: one scraper, N transferors,
//! one cleaner, and one reporter. They communicate over bounded channels;
//! the scraper blocks on a full queue, which is all the backpressure the
//! pipeline needs. A shared cancellation token shuts everything down
//! cooperatively on SIGINT/SIGTERM.

pub mod cleaner;
pub mod report;
pub mod scraper;
pub mod transferor;

pub use cleaner::{Cleaner, FileInfoForCleaner};
pub use report::{Report, ReportEvent, RunSummary, Stats};
pub use scraper::{Directory, Scraper};
pub use transferor::Transferor;

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Job;
use crate::transfer::File;

/// Capacity of the scraper→transferor and transferor→cleaner queues
const QUEUE_CAPACITY: usize = 10;

/// Run the scrape/transfer/cleanup pipeline to completion.
///
/// The cleaner only starts acting once every transferor has exited its main
/// loop (its input channel closes at that point), so cleanup decisions are
/// always based on the complete set of transfer outcomes.
pub async fn run_pipeline(
    ctx: &CancellationToken,
    jobs: Vec<Arc<Job>>,
    transfer_worker_count: u32,
    report: mpsc::Sender<ReportEvent>,
) {
    let (file_tx, file_rx) = mpsc::channel::<File>(QUEUE_CAPACITY);
    let (cleaner_tx, cleaner_rx) = mpsc::channel::<FileInfoForCleaner>(QUEUE_CAPACITY);

    let scraper = tokio::spawn(
        Scraper {
            jobs,
            output: file_tx,
            report: report.clone(),
        }
        .run(ctx.clone()),
    );

    let shared_input = Arc::new(Mutex::new(file_rx));
    let mut transferors = Vec::new();
    for _ in 0..transfer_worker_count.max(1) {
        transferors.push(tokio::spawn(
            Transferor {
                input: Arc::clone(&shared_input),
                output: cleaner_tx.clone(),
                report: report.clone(),
            }
            .run(ctx.clone()),
        ));
    }
    // the transferors hold the only senders now; when the last one exits,
    // the cleaner input closes and the cleanup phase begins
    drop(cleaner_tx);

    let cleaner = tokio::spawn(
        Cleaner {
            input: cleaner_rx,
            report,
        }
        .run(ctx.clone()),
    );

    for task in transferors {
        let _ = task.await;
    }
    let _ = cleaner.await;
    let _ = scraper.await;
}
