// src/matcher.rs

//! Path filtering for transfer jobs.
//!
//! A `Matcher` decides whether a source path is included in a job, and it
//! also carries the `immutable` pattern that lets the transfer engine skip
//! files which can never change once uploaded. Directory paths must carry a
//! trailing slash so that patterns can distinguish `docs/` from a file named
//! `docs`.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::sources::FileSpec;

/// Decides which files and directories belong to a transfer job
#[derive(Debug, Default, Clone)]
pub struct Matcher {
    /// Paths matching this pattern are excluded
    pub exclude_rx: Option<Regex>,
    /// If set, only paths matching this pattern are included
    pub include_rx: Option<Regex>,
    /// Files matching this pattern never change once uploaded
    pub immutable_rx: Option<Regex>,
    /// Files whose last modification is before this cutoff are excluded
    pub not_older_than: Option<DateTime<Utc>>,
}

impl Matcher {
    /// Check whether the directory at `path` should be scraped, or whether
    /// the file at `path` should be transferred.
    ///
    /// Returns `None` if the path is included, or `Some(reason)` with a
    /// human-readable explanation why it is excluded. If `path` is a
    /// directory it must have a trailing slash; a file must not.
    pub fn check(&self, path: &str, last_modified: Option<DateTime<Utc>>) -> Option<String> {
        // never reject the root, otherwise recursive checks would exclude
        // everything
        if clean_path(path) == "/" {
            return None;
        }
        if let (Some(cutoff), Some(mtime)) = (self.not_older_than, last_modified) {
            if mtime < cutoff {
                return Some(format!("is older than {cutoff}"));
            }
        }
        if let Some(rx) = &self.exclude_rx {
            if rx.is_match(path) {
                return Some(format!("is excluded by `{}`", rx.as_str()));
            }
        }
        if let Some(rx) = &self.include_rx {
            if !rx.is_match(path) {
                return Some(format!("is not included by `{}`", rx.as_str()));
            }
        }
        None
    }

    /// Like `check_recursive`, but takes the path and modification time from
    /// a `FileSpec` and appends a slash for directories.
    pub fn check_file(&self, spec: &FileSpec) -> Option<String> {
        if spec.is_directory {
            self.check_recursive(&format!("{}/", spec.path.trim_end_matches('/')), None)
        } else {
            self.check_recursive(&spec.path, spec.last_modified)
        }
    }

    /// Like `check`, but also checks each ancestor directory along the way.
    /// The first exclusion wins.
    pub fn check_recursive(
        &self,
        path: &str,
        last_modified: Option<DateTime<Utc>>,
    ) -> Option<String> {
        let cleaned = clean_path(path);
        let trimmed = cleaned.trim_start_matches('/');
        let mut prefix = String::new();
        for component in trimmed.split('/') {
            // the final component is checked below with the original path,
            // which retains any trailing slash
            if prefix.len() + component.len() >= trimmed.len() {
                break;
            }
            prefix.push_str(component);
            prefix.push('/');
            if let Some(reason) = self.check(&prefix, None) {
                return Some(reason);
            }
        }
        self.check(path, last_modified)
    }
}

/// Normalize a slash-separated path: collapse duplicate slashes, resolve `.`
/// and `..` components, strip any leading slash. An empty result is reported
/// as "/" so that root paths are recognizable.
pub fn clean_path(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    if components.is_empty() {
        "/".to_string()
    } else {
        components.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn matcher(exclude: Option<&str>, include: Option<&str>) -> Matcher {
        Matcher {
            exclude_rx: exclude.map(|p| Regex::new(p).unwrap()),
            include_rx: include.map(|p| Regex::new(p).unwrap()),
            ..Matcher::default()
        }
    }

    #[test]
    fn test_root_is_always_included() {
        let m = matcher(Some(".*"), None);
        assert_eq!(m.check("/", None), None);
        assert_eq!(m.check_recursive("/", None), None);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let m = matcher(Some(r"\.tmp$"), Some(r"\.tmp$"));
        assert!(m.check("a.tmp", None).is_some());
    }

    #[test]
    fn test_include_pattern() {
        let m = matcher(None, Some(r"\.rpm$"));
        assert_eq!(m.check("Packages/foo.rpm", None), None);
        assert!(m.check("Packages/foo.txt", None).is_some());
    }

    #[test]
    fn test_recursive_checks_ancestors() {
        // excluding a directory excludes every descendant
        let m = matcher(Some(r"^a/b/$"), None);
        assert!(m.check_recursive("a/b/c.txt", None).is_some());
        assert_eq!(m.check_recursive("a/x/c.txt", None), None);
    }

    #[test]
    fn test_check_file_appends_slash_for_directories() {
        let m = matcher(Some(r"^sub/$"), None);
        let dir = FileSpec {
            path: "sub".into(),
            is_directory: true,
            ..FileSpec::default()
        };
        assert!(m.check_file(&dir).is_some());
        let file = FileSpec {
            path: "sub".into(),
            ..FileSpec::default()
        };
        assert_eq!(m.check_file(&file), None);
    }

    #[test]
    fn test_not_older_than() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let m = Matcher {
            not_older_than: Some(cutoff),
            ..Matcher::default()
        };
        let old = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(m.check("a.txt", Some(old)).is_some());
        assert_eq!(m.check("a.txt", Some(new)), None);
        // unknown modification time passes
        assert_eq!(m.check("a.txt", None), None);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/a//b/"), "a/b");
        assert_eq!(clean_path("a/./b"), "a/b");
        assert_eq!(clean_path("a/b/../c"), "a/c");
    }
}
