// tests/scraper_test.rs

//! Scraper behavior: retry ordering, job ordering, and incomplete-scrape
//! marking.

mod common;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{InMemoryStore, JobBuilder};
use swift_mirror::actors::{ReportEvent, Scraper};
use swift_mirror::sources::{
    FileBody, FileSpec, FileState, GetConditions, ListError, Source,
};
use swift_mirror::{Error, Result};

enum Step {
    Fail,
    Listing(Vec<FileSpec>),
}

/// A source whose directory listings follow a script: each call to
/// `list_entries` consumes the next step for that path
#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
}

impl ScriptedSource {
    fn on(mut self, path: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert(path.to_string(), steps.into());
        self
    }
}

fn file(path: &str) -> FileSpec {
    FileSpec {
        path: path.to_string(),
        ..FileSpec::default()
    }
}

fn directory(path: &str) -> FileSpec {
    FileSpec {
        path: path.to_string(),
        is_directory: true,
        ..FileSpec::default()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn validate(&mut self, _name: &str) -> Vec<Error> {
        Vec::new()
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        Err(ListError::NotSupported)
    }

    async fn list_entries(
        &self,
        directory_path: &str,
    ) -> std::result::Result<Vec<FileSpec>, ListError> {
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(directory_path)
            .and_then(VecDeque::pop_front);
        match step {
            None => Ok(Vec::new()),
            Some(Step::Listing(entries)) => Ok(entries),
            Some(Step::Fail) => Err(ListError::failed(directory_path, "scripted failure")),
        }
    }

    async fn get_file(
        &self,
        spec: &FileSpec,
        _conditions: &GetConditions,
    ) -> Result<(Option<FileBody>, FileState)> {
        Err(Error::Download(format!("not scripted: {}", spec.path)))
    }
}

struct ScrapeOutcome {
    emitted_paths: Vec<String>,
    events: Vec<ReportEvent>,
}

async fn run_scraper(jobs: Vec<std::sync::Arc<swift_mirror::config::Job>>) -> ScrapeOutcome {
    let (file_tx, mut file_rx) = mpsc::channel(64);
    let (report_tx, mut report_rx) = mpsc::channel(64);
    Scraper {
        jobs,
        output: file_tx,
        report: report_tx,
    }
    .run(CancellationToken::new())
    .await;

    let mut emitted_paths = Vec::new();
    while let Ok(file) = file_rx.try_recv() {
        emitted_paths.push(file.spec.path);
    }
    let mut events = Vec::new();
    while let Ok(event) = report_rx.try_recv() {
        events.push(event);
    }
    ScrapeOutcome {
        emitted_paths,
        events,
    }
}

#[tokio::test]
async fn test_failed_directory_is_retried_after_all_other_work() {
    let source = ScriptedSource::default()
        .on("/", vec![Step::Listing(vec![
            directory("a"),
            directory("b"),
            directory("c"),
        ])])
        .on("a", vec![Step::Listing(vec![file("a/f.txt")])])
        .on("b", vec![Step::Fail, Step::Listing(vec![file("b/f.txt")])])
        .on("c", vec![Step::Listing(vec![file("c/f.txt")])]);

    let store = InMemoryStore::new();
    let job = JobBuilder::new(Box::new(source), &store, "mirror").build().await;
    let outcome = run_scraper(vec![std::sync::Arc::clone(&job)]).await;

    // directories are walked LIFO (c first); the failed "b" goes to the
    // bottom of the stack and is only retried after everything else
    assert_eq!(outcome.emitted_paths, vec!["c/f.txt", "a/f.txt", "b/f.txt"]);
    assert!(!job.is_scraping_incomplete.load(Ordering::Relaxed));

    let failed = outcome
        .events
        .iter()
        .filter(|event| matches!(event, ReportEvent::Directory { failed: true }))
        .count();
    assert_eq!(failed, 0);
}

#[tokio::test]
async fn test_three_failures_mark_the_scrape_incomplete() {
    let source = ScriptedSource::default()
        .on("/", vec![Step::Listing(vec![directory("a"), file("top.txt")])])
        .on("a", vec![Step::Fail, Step::Fail, Step::Fail]);

    let store = InMemoryStore::new();
    let job = JobBuilder::new(Box::new(source), &store, "mirror").build().await;
    let outcome = run_scraper(vec![std::sync::Arc::clone(&job)]).await;

    assert_eq!(outcome.emitted_paths, vec!["top.txt"]);
    assert!(job.is_scraping_incomplete.load(Ordering::Relaxed));

    let failed = outcome
        .events
        .iter()
        .filter(|event| matches!(event, ReportEvent::Directory { failed: true }))
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_unscrapable_root_counts_as_skipped_job() {
    let source =
        ScriptedSource::default().on("/", vec![Step::Fail, Step::Fail, Step::Fail]);

    let store = InMemoryStore::new();
    let job = JobBuilder::new(Box::new(source), &store, "mirror").build().await;
    let outcome = run_scraper(vec![job]).await;

    assert!(outcome.emitted_paths.is_empty());
    let skipped = outcome
        .events
        .iter()
        .filter(|event| matches!(event, ReportEvent::JobSkipped))
        .count();
    assert_eq!(skipped, 1);
}

#[tokio::test]
async fn test_first_job_is_scraped_before_the_second() {
    let store = InMemoryStore::new();

    let first = ScriptedSource::default()
        .on("/", vec![Step::Listing(vec![file("first.txt")])]);
    let second = ScriptedSource::default()
        .on("/", vec![Step::Listing(vec![file("second.txt")])]);

    let job1 = JobBuilder::new(Box::new(first), &store, "mirror").build().await;
    let job2 = JobBuilder::new(Box::new(second), &store, "mirror").build().await;
    let outcome = run_scraper(vec![job1, job2]).await;

    assert_eq!(outcome.emitted_paths, vec!["first.txt", "second.txt"]);
}

#[tokio::test]
async fn test_excluded_directories_are_not_descended_into() {
    let source = ScriptedSource::default()
        .on("/", vec![Step::Listing(vec![
            directory("keep"),
            directory("skip"),
        ])])
        .on("keep", vec![Step::Listing(vec![file("keep/f.txt")])])
        .on("skip", vec![Step::Listing(vec![file("skip/f.txt")])]);

    let store = InMemoryStore::new();
    let mut builder = JobBuilder::new(Box::new(source), &store, "mirror");
    builder.matcher = swift_mirror::matcher::Matcher {
        exclude_rx: Some(regex::Regex::new(r"^skip/$").unwrap()),
        ..Default::default()
    };
    let job = builder.build().await;
    let outcome = run_scraper(vec![job]).await;

    assert_eq!(outcome.emitted_paths, vec!["keep/f.txt"]);
}
