// src/config.rs

//! Configuration loading and job compilation.
//!
//! The YAML file is deserialized into typed structs, then each job
//! configuration is compiled into a runtime `Job`: regexes are compiled,
//! credentials inherited, sources validated and connected, target
//! containers created, and (where needed) the existing target objects
//! enumerated. All validation errors are collected and reported together
//! rather than failing on the first one.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gpg::{GpgKeyring, KeyCache};
use crate::matcher::Matcher;
use crate::sources::debian::DebianSource;
use crate::sources::github::GithubReleaseSource;
use crate::sources::http::{default_client, UrlSource};
use crate::sources::swift::SwiftLocation;
use crate::sources::yum::YumSource;
use crate::sources::Source;

/// The contents of the configuration file
#[derive(Default, Deserialize)]
pub struct Configuration {
    /// Credentials shared by all target locations
    #[serde(default)]
    pub swift: SwiftLocation,
    #[serde(default)]
    pub workers: WorkerCounts,
    #[serde(default)]
    pub statsd: StatsdConfiguration,
    #[serde(default)]
    pub gpg: GpgConfiguration,
    #[serde(default, rename = "jobs")]
    pub job_configs: Vec<JobConfiguration>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct WorkerCounts {
    #[serde(default)]
    pub transfer: u32,
}

/// StatsD metric emission; an empty hostname disables it
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StatsdConfiguration {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub prefix: String,
}

/// Debian signature verification options
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GpgConfiguration {
    /// Keyserver URL patterns with a `{keyid}` placeholder, tried in order
    #[serde(default)]
    pub keyserver_urls: Vec<String>,
    /// Swift container in which discovered public keys are cached across
    /// runs
    #[serde(default)]
    pub cache_container: Option<String>,
}

/// One transfer job as it appears in the configuration file
#[derive(Default, Deserialize)]
pub struct JobConfiguration {
    #[serde(default)]
    pub from: Option<SourceConfiguration>,
    #[serde(default)]
    pub to: Option<SwiftLocation>,
    #[serde(default, rename = "except")]
    pub exclude_pattern: Option<String>,
    #[serde(default, rename = "only")]
    pub include_pattern: Option<String>,
    #[serde(default, rename = "immutable")]
    pub immutable_file_pattern: Option<String>,
    #[serde(default)]
    pub segmenting: Option<SegmentingConfiguration>,
    #[serde(default)]
    pub expiration: ExpirationConfiguration,
    #[serde(default)]
    pub cleanup: CleanupConfiguration,
    #[serde(default, rename = "match")]
    pub match_config: MatchConfiguration,
}

/// Large-object upload thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentingConfiguration {
    #[serde(default, rename = "min_bytes")]
    pub min_object_size: u64,
    #[serde(default, rename = "segment_bytes")]
    pub segment_size: u64,
    /// Defaults to `<target container>_segments`
    #[serde(default)]
    pub container: String,
}

/// Propagation of source-side object expiration to the target
#[derive(Debug, Clone, Deserialize)]
pub struct ExpirationConfiguration {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delay_seconds: u32,
}

impl Default for ExpirationConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_seconds: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

/// What to do with target objects that the source does not know
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStrategy {
    /// Leave unknown objects alone
    #[default]
    Keep,
    /// Log each unknown object
    Report,
    /// Delete unknown objects
    Delete,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct CleanupConfiguration {
    #[serde(default)]
    pub strategy: CleanupStrategy,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct MatchConfiguration {
    #[serde(default)]
    pub not_older_than: Option<AgeSpec>,
}

/// A duration deserialized from `"<count> <unit>"`, e.g. `"2 h"` or
/// `"4 days"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeSpec(pub Duration);

static AGE_SPEC_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([0-9]+)\s*([a-zA-Z]+)\s*$").expect("static regex"));

fn age_spec_unit(unit: &str) -> Option<Duration> {
    let seconds = match unit {
        "s" | "second" | "seconds" => 1,
        "m" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86400,
        "w" | "week" | "weeks" => 7 * 86400,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

impl AgeSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let captures = AGE_SPEC_RX.captures(input).ok_or_else(|| {
            Error::Config(format!(
                "expected age specification in the format \"<value> <unit>\", e.g. \"2h\" or \"4 days\", got {input:?} instead"
            ))
        })?;
        let count: u32 = captures[1]
            .parse()
            .map_err(|e| Error::Config(format!("invalid age specification {input:?}: {e}")))?;
        let unit = age_spec_unit(&captures[2])
            .ok_or_else(|| Error::Config(format!("unknown unit {:?}", &captures[2])))?;
        Ok(Self(unit * count))
    }

    /// The absolute cutoff corresponding to this age, measured from now
    pub fn cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::zero())
    }
}

impl<'de> Deserialize<'de> for AgeSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let input = String::deserialize(deserializer)?;
        Self::parse(&input).map_err(serde::de::Error::custom)
    }
}

/// A source as it appears in the configuration file. The kind is inferred
/// from the keys: a mapping with a `url` key is URL-based (further
/// discriminated by its `type` tag), anything else is a Swift location.
pub enum SourceConfiguration {
    Url(UrlSource),
    Yum(YumSource),
    Debian(DebianSource),
    Github(GithubReleaseSource),
    Swift(SwiftLocation),
}

impl<'de> Deserialize<'de> for SourceConfiguration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        let value = serde_yaml::Value::deserialize(deserializer)?;
        let mapping = value
            .as_mapping()
            .ok_or_else(|| D::Error::custom("source must be a mapping"))?;

        let key = |name: &str| serde_yaml::Value::String(name.to_string());
        if !mapping.contains_key(&key("url")) {
            let location = serde_yaml::from_value(value.clone()).map_err(D::Error::custom)?;
            return Ok(Self::Swift(location));
        }

        let type_tag = mapping
            .get(&key("type"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        match type_tag {
            "" => Ok(Self::Url(
                serde_yaml::from_value(value.clone()).map_err(D::Error::custom)?,
            )),
            "yum" => Ok(Self::Yum(
                serde_yaml::from_value(value.clone()).map_err(D::Error::custom)?,
            )),
            "debian" => Ok(Self::Debian(
                serde_yaml::from_value(value.clone()).map_err(D::Error::custom)?,
            )),
            "github-releases" => Ok(Self::Github(
                serde_yaml::from_value(value.clone()).map_err(D::Error::custom)?,
            )),
            other => Err(D::Error::custom(format!(
                "unknown source type {other:?} (expected \"yum\", \"debian\" or \"github-releases\")"
            ))),
        }
    }
}

impl SourceConfiguration {
    fn validate(&mut self, name: &str) -> Vec<Error> {
        match self {
            Self::Url(source) => Source::validate(source, name),
            Self::Yum(source) => Source::validate(source, name),
            Self::Debian(source) => Source::validate(source, name),
            Self::Github(source) => Source::validate(source, name),
            Self::Swift(source) => Source::validate(source, name),
        }
    }

    fn into_source(self) -> Box<dyn Source> {
        match self {
            Self::Url(source) => Box::new(source),
            Self::Yum(source) => Box::new(source),
            Self::Debian(source) => Box::new(source),
            Self::Github(source) => Box::new(source),
            Self::Swift(source) => Box::new(source),
        }
    }
}

/// A transfer job at runtime
pub struct Job {
    pub source: Box<dyn Source>,
    pub target: SwiftLocation,
    pub matcher: Matcher,
    pub segmenting: Option<SegmentingConfiguration>,
    pub expiration: ExpirationConfiguration,
    pub cleanup: CleanupConfiguration,
    /// Set by the scraper when it gave up on any directory of this job.
    /// Only read after the scraper has exited.
    pub is_scraping_incomplete: AtomicBool,
}

/// Read and deserialize the configuration file, applying defaults
pub fn read_configuration(path: &str) -> std::result::Result<Configuration, Vec<Error>> {
    let config_bytes = std::fs::read(path)
        .map_err(|e| vec![Error::Io(format!("cannot read {path}: {e}"))])?;
    let mut config: Configuration = serde_yaml::from_slice(&config_bytes)
        .map_err(|e| vec![Error::Config(format!("cannot parse {path}: {e}"))])?;

    if config.workers.transfer == 0 {
        config.workers.transfer = 1;
    }
    if !config.statsd.hostname.is_empty() && config.statsd.port == 0 {
        config.statsd.port = 8125;
    }
    if config.statsd.prefix.is_empty() {
        config.statsd.prefix = "swift_mirror".to_string();
    }
    config.swift.validate_ignore_empty_container = true;

    Ok(config)
}

/// Compile all job configurations into runtime jobs. Validation errors of
/// every job are collected; connection attempts are only made when the
/// whole configuration is sound.
pub async fn compile_jobs(
    config: &mut Configuration,
) -> std::result::Result<Vec<Arc<Job>>, Vec<Error>> {
    let mut errors = config.swift.validate("swift");

    // one shared keyring for all Debian sources that verify signatures
    let mut keyring: Option<Arc<GpgKeyring>> = None;

    let mut jobs = Vec::new();
    for (index, job_config) in config.job_configs.drain(..).enumerate() {
        let name = format!("jobs[{index}]");
        match compile_job(
            job_config,
            &name,
            &config.swift,
            &config.gpg,
            &mut keyring,
        )
        .await
        {
            Ok(job) => jobs.push(Arc::new(job)),
            Err(mut job_errors) => errors.append(&mut job_errors),
        }
    }

    if errors.is_empty() {
        Ok(jobs)
    } else {
        Err(errors)
    }
}

async fn compile_job(
    job_config: JobConfiguration,
    name: &str,
    swift: &SwiftLocation,
    gpg: &GpgConfiguration,
    keyring: &mut Option<Arc<GpgKeyring>>,
) -> std::result::Result<Job, Vec<Error>> {
    let mut errors = Vec::new();

    let mut source_config = job_config.from;
    match &mut source_config {
        Some(source_config) => {
            errors.extend(source_config.validate(&format!("{name}.from")));
        }
        None => errors.push(Error::Config(format!("missing value for {name}.from"))),
    }

    let mut target = match job_config.to {
        Some(target) => Some(target),
        None => {
            errors.push(Error::Config(format!("missing value for {name}.to")));
            None
        }
    };
    if let Some(target) = &mut target {
        target.inherit_credentials(swift);
        errors.extend(target.validate(&format!("{name}.to")));
    }

    let mut segmenting = job_config.segmenting;
    if let Some(segmenting) = &mut segmenting {
        if segmenting.min_object_size == 0 {
            errors.push(Error::Config(format!(
                "missing value for {name}.segmenting.min_bytes"
            )));
        }
        if segmenting.segment_size == 0 {
            errors.push(Error::Config(format!(
                "missing value for {name}.segmenting.segment_bytes"
            )));
        }
        if segmenting.container.is_empty() {
            if let Some(target) = &target {
                segmenting.container = format!("{}_segments", target.container);
            }
        }
    }

    // compile the filter patterns
    let mut matcher = Matcher::default();
    let mut compile_optional_regex = |key: &str, pattern: &Option<String>| -> Option<Regex> {
        let pattern = pattern.as_deref()?;
        match Regex::new(pattern) {
            Ok(rx) => Some(rx),
            Err(e) => {
                errors.push(Error::Config(format!("malformed regex in {name}.{key}: {e}")));
                None
            }
        }
    };
    matcher.exclude_rx = compile_optional_regex("except", &job_config.exclude_pattern);
    matcher.include_rx = compile_optional_regex("only", &job_config.include_pattern);
    matcher.immutable_rx = compile_optional_regex("immutable", &job_config.immutable_file_pattern);
    matcher.not_older_than = job_config.match_config.not_older_than.map(|age| age.cutoff());

    // don't try connecting anywhere if the configuration is unsound
    if !errors.is_empty() {
        return Err(errors);
    }
    let mut source_config = source_config.expect("validated above");
    let mut target = target.expect("validated above");

    let http = match default_client() {
        Ok(client) => client,
        Err(e) => return Err(vec![e]),
    };

    if let Err(e) = target.connect(&http).await {
        return Err(vec![e]);
    }
    if let Some(segmenting) = &segmenting {
        if let Err(e) = target.ensure_container_exists(&segmenting.container).await {
            return Err(vec![e]);
        }
    }

    // wire job-level settings into the sources that need them
    match &mut source_config {
        SourceConfiguration::Github(github) => {
            github.not_older_than = matcher.not_older_than;
        }
        SourceConfiguration::Debian(debian) if debian.verify_signature => {
            if keyring.is_none() {
                match build_keyring(gpg, swift, &http).await {
                    Ok(built) => *keyring = Some(built),
                    Err(e) => return Err(vec![e]),
                }
            }
            debian.keyring = keyring.clone();
        }
        _ => {}
    }

    let mut source = source_config.into_source();
    if let Err(e) = source.connect().await {
        return Err(vec![e]);
    }

    // enumerate the existing target objects where a later phase needs them:
    // the immutability shortcut decides "already transferred" from this
    // set, and the cleaner computes its deletion candidates from it
    if matcher.immutable_rx.is_some() || job_config.cleanup.strategy != CleanupStrategy::Keep {
        if let Err(e) = target.discover_existing_files(&matcher).await {
            return Err(vec![e]);
        }
    }

    Ok(Job {
        source,
        target,
        matcher,
        segmenting,
        expiration: job_config.expiration,
        cleanup: job_config.cleanup,
        is_scraping_incomplete: AtomicBool::new(false),
    })
}

/// Build the shared GPG keyring, with its persistent key cache in Swift if
/// one is configured
async fn build_keyring(
    gpg: &GpgConfiguration,
    swift: &SwiftLocation,
    http: &reqwest::Client,
) -> Result<Arc<GpgKeyring>> {
    let cache = match &gpg.cache_container {
        Some(container) => {
            let mut location = swift.clone();
            location.validate_ignore_empty_container = true;
            location.connect(http).await?;
            Some(KeyCache {
                store: Arc::clone(location.store()?),
                container: container.clone(),
            })
        }
        None => None,
    };
    let keyring = GpgKeyring::new(gpg.keyserver_urls.clone(), http.clone(), cache).await?;
    Ok(Arc::new(keyring))
}
