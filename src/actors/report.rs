// src/actors/report.rs

//! The report actor.
//!
//! Counts scraped directories, found/transferred/failed files and cleaned-up
//! objects, emits StatsD gauges when a metric sink is configured, logs the
//! final summary, and decides the process exit code.

use cadence::{Gauged, StatsdClient, UdpMetricSink};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::StatsdConfiguration;
use crate::transfer::TransferResult;

/// One tally mark for the report actor
#[derive(Debug, Clone, Copy)]
pub enum ReportEvent {
    /// A directory was scraped (or finally given up on)
    Directory { failed: bool },
    /// A file went through the transfer engine
    File { result: TransferResult, bytes: u64 },
    /// Objects were deleted during cleanup
    Cleanup { count: u64 },
    /// A whole job produced no work because its root could not be scraped
    JobSkipped,
}

/// Accumulated statistics of one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub directories_scanned: u64,
    pub directories_failed: u64,
    pub files_found: u64,
    pub files_transferred: u64,
    pub files_failed: u64,
    pub files_cleaned_up: u64,
    pub bytes_transferred: u64,
    pub jobs_skipped: u64,
}

impl Stats {
    /// Apply one event to the counters
    pub fn count(&mut self, event: ReportEvent) {
        match event {
            ReportEvent::Directory { failed } => {
                self.directories_scanned += 1;
                if failed {
                    self.directories_failed += 1;
                }
            }
            ReportEvent::File { result, bytes } => {
                self.files_found += 1;
                match result {
                    TransferResult::Success => {
                        self.files_transferred += 1;
                        self.bytes_transferred += bytes;
                    }
                    TransferResult::Failed => self.files_failed += 1,
                    TransferResult::Skipped => {}
                }
            }
            ReportEvent::Cleanup { count } => self.files_cleaned_up += count,
            ReportEvent::JobSkipped => self.jobs_skipped += 1,
        }
    }

    /// Whether this run counts as successful
    pub fn is_success(&self) -> bool {
        self.files_failed == 0 && self.directories_failed == 0
    }
}

/// Final outcome of the report actor
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub exit_code: i32,
    pub stats: Stats,
    pub duration: Duration,
}

/// Aggregates `ReportEvent`s until the input channel closes
pub struct Report {
    pub input: mpsc::Receiver<ReportEvent>,
    pub statsd: StatsdConfiguration,
    pub start_time: Instant,
}

impl Report {
    pub async fn run(mut self) -> RunSummary {
        let statter = self.build_statter();

        let mut stats = Stats::default();
        while let Some(event) = self.input.recv().await {
            stats.count(event);
        }

        let gauge = |bucket: &str, value: u64| {
            if let Some(statter) = &statter {
                if let Err(e) = statter.gauge(bucket, value) {
                    error!(
                        "statsd: could not submit value {} for bucket {:?}: {}",
                        value, bucket, e
                    );
                }
            }
        };

        gauge("last_run.jobs_skipped", stats.jobs_skipped);
        gauge("last_run.dirs_scanned", stats.directories_scanned);
        gauge("last_run.files_found", stats.files_found);
        gauge("last_run.files_transfered", stats.files_transferred);
        gauge("last_run.files_failed", stats.files_failed);
        gauge("last_run.files_cleaned_up", stats.files_cleaned_up);
        gauge("last_run.bytes_transfered", stats.bytes_transferred);

        let exit_code = if stats.is_success() {
            gauge("last_run.success", 1);
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            gauge("last_run.success_timestamp", now);
            0
        } else {
            gauge("last_run.success", 0);
            1
        };

        info!("{} jobs skipped", stats.jobs_skipped);
        info!(
            "{} dirs scanned, {} failed",
            stats.directories_scanned, stats.directories_failed
        );
        info!(
            "{} files found, {} transferred, {} failed",
            stats.files_found, stats.files_transferred, stats.files_failed
        );
        if stats.files_cleaned_up > 0 {
            info!("{} old files cleaned up", stats.files_cleaned_up);
        }
        info!("{} bytes transferred", stats.bytes_transferred);

        let duration = self.start_time.elapsed();
        gauge("last_run.duration_seconds", duration.as_secs());
        info!("finished in {:.3}s", duration.as_secs_f64());

        RunSummary {
            exit_code,
            stats,
            duration,
        }
    }

    fn build_statter(&self) -> Option<StatsdClient> {
        if self.statsd.hostname.is_empty() {
            return None;
        }
        let socket = match std::net::UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => socket,
            Err(e) => {
                error!("statsd: cannot bind UDP socket: {}", e);
                return None;
            }
        };
        let address = (self.statsd.hostname.as_str(), self.statsd.port);
        match UdpMetricSink::from(address, socket) {
            Ok(sink) => Some(StatsdClient::from_sink(&self.statsd.prefix, sink)),
            Err(e) => {
                error!("statsd: cannot create sink for {:?}: {}", address, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let mut stats = Stats::default();
        stats.count(ReportEvent::Directory { failed: false });
        stats.count(ReportEvent::Directory { failed: true });
        stats.count(ReportEvent::File {
            result: TransferResult::Success,
            bytes: 100,
        });
        stats.count(ReportEvent::File {
            result: TransferResult::Skipped,
            bytes: 0,
        });
        stats.count(ReportEvent::File {
            result: TransferResult::Failed,
            bytes: 0,
        });
        stats.count(ReportEvent::Cleanup { count: 3 });
        stats.count(ReportEvent::JobSkipped);

        assert_eq!(stats.directories_scanned, 2);
        assert_eq!(stats.directories_failed, 1);
        assert_eq!(stats.files_found, 3);
        assert_eq!(stats.files_transferred, 1);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.bytes_transferred, 100);
        assert_eq!(stats.files_cleaned_up, 3);
        assert_eq!(stats.jobs_skipped, 1);
        assert!(!stats.is_success());
    }

    #[test]
    fn test_success_requires_no_failures() {
        let mut stats = Stats::default();
        stats.count(ReportEvent::File {
            result: TransferResult::Success,
            bytes: 1,
        });
        assert!(stats.is_success());
        stats.count(ReportEvent::Directory { failed: true });
        assert!(!stats.is_success());
    }
}
