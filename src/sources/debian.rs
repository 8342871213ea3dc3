// src/sources/debian.rs

//! Debian repositories as a source.
//!
//! Like the Yum source, this walks repository metadata instead of directory
//! listings: the `InRelease` file (or legacy `Release` with its detached
//! signature) names every index of a distribution, the `Packages` indexes
//! name the `.deb` files and the `Sources` indexes name the source
//! artifacts.
//!
//! Packages of different distributions share the `pool/` area, so the same
//! file can be referenced from several distributions; it is emitted exactly
//! once. The `InRelease`/`Release`/`Release.gpg` trio goes at the very end
//! of each distribution's file list, after every package it references.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tracing::debug;

use super::http::UrlSource;
use super::{
    assemble_file_specs, join_paths, FileBody, FileSpec, FileState, GetConditions, ListError,
    Source,
};
use crate::compression::decompress_auto;
use crate::dcf::{self, Paragraph};
use crate::error::Error;
use crate::gpg::{split_clearsigned, GpgKeyring, CLEARSIGN_HEADER};

// Index entries listed in the `SHA256` field of a Release file. The capture
// groups of interest are the component and the architecture.

/// `<component>/Contents-<arch>.gz` and friends; arch is capture group 4
static CONTENTS_ENTRY_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([a-zA-Z]+)/)?Contents-(udeb-)?([a-zA-Z0-9]+)(\.gz|\.xz)$")
        .expect("static regex")
});

/// `<component>/dep11/icons-NxN.tar.gz` and `<component>/dep11/Components-<arch>.yml.gz`;
/// arch is capture group 6 (empty for icon files)
static DEP11_ENTRY_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z]+)/dep11/((icons-([0-9]+x[0-9]+)\.tar)|(Components-([a-zA-Z0-9]+)\.yml))(\.xz|\.gz)$")
        .expect("static regex")
});

/// `<component>/binary-<arch>/Packages.gz` (optionally under
/// `debian-installer/`); arch is capture group 3
static PACKAGES_ENTRY_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z]+)/(debian-installer/)?binary-([a-zA-Z0-9]+)/Packages(\.gz|\.xz)$")
        .expect("static regex")
});

/// `<component>/i18n/Index` and `<component>/i18n/Translation-<lang>.gz`
static TRANSLATION_ENTRY_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z]+)/i18n/((Index)|(Translation-[a-zA-Z0-9_-]+(\.gz|\.xz)))$")
        .expect("static regex")
});

/// A `UrlSource` containing a Debian repository
#[derive(Clone, Default, Deserialize)]
pub struct DebianSource {
    #[serde(flatten)]
    pub url_source: UrlSource,
    /// Distributions to mirror, e.g. `["jammy", "jammy-updates"]`
    #[serde(default, rename = "dist")]
    pub distributions: Vec<String>,
    /// Architecture allow-list; empty means "as declared by the Release file"
    #[serde(default, rename = "arch")]
    pub architectures: Vec<String>,
    /// Verify InRelease/Release signatures (default on)
    #[serde(default, rename = "verify_signature")]
    pub verify_signature_in: Option<bool>,

    #[serde(skip)]
    pub verify_signature: bool,
    /// Injected at job compile time when verification is enabled
    #[serde(skip)]
    pub keyring: Option<Arc<GpgKeyring>>,
}

/// Everything we need from a parsed Release file
struct ReleaseInfo {
    architectures: Vec<String>,
    components: Vec<String>,
    acquire_by_hash: bool,
    sha256_entries: Vec<dcf::FileListEntry>,
}

impl DebianSource {
    /// Download a control file, remember it in the cache, and parse it.
    /// Compressed indexes (gzip, xz, zstd) are decompressed transparently.
    async fn download_and_parse_dcf(
        &self,
        path: &str,
        cache: &mut HashMap<String, FileSpec>,
    ) -> std::result::Result<(Vec<Paragraph>, String), ListError> {
        let (contents, uri) = self.url_source.get_file_contents(path, cache).await?;
        let decompressed = decompress_auto(&contents)
            .map_err(|e| ListError::failed(&uri, format!("error while decompressing: {e}")))?;
        let text = String::from_utf8(decompressed)
            .map_err(|e| ListError::failed(&uri, format!("index is not valid UTF-8: {e}")))?;
        let paragraphs = dcf::parse(&text).map_err(|e| {
            ListError::failed(&uri, format!("error while parsing Debian control file: {e}"))
        })?;
        Ok((paragraphs, uri))
    }

    /// Fetch and parse the Release information for one distribution,
    /// preferring `InRelease` and falling back to the legacy `Release` file.
    /// Signatures are verified when enabled.
    async fn fetch_release(
        &self,
        dist_root: &str,
        cache: &mut HashMap<String, FileSpec>,
    ) -> std::result::Result<ReleaseInfo, ListError> {
        let in_release_path = join_paths(dist_root, "InRelease");
        match self.url_source.get_file_contents(&in_release_path, cache).await {
            Ok((contents, uri)) => {
                let message = if contents.starts_with(CLEARSIGN_HEADER) {
                    match self.verification_keyring() {
                        Some(keyring) => keyring
                            .verify_clearsigned(&contents)
                            .await
                            .map_err(|e| ListError::failed(&uri, e.to_string()))?,
                        None => {
                            split_clearsigned(&contents)
                                .map_err(|e| ListError::failed(&uri, e.to_string()))?
                                .0
                        }
                    }
                } else {
                    contents.to_vec()
                };
                parse_release(&message).map_err(|e| ListError::failed(&uri, e.to_string()))
            }
            Err(in_release_error) => {
                // some older distributions only publish the legacy pair
                debug!("falling back to Release: {}", in_release_error);
                let release_path = join_paths(dist_root, "Release");
                let (contents, uri) = self
                    .url_source
                    .get_file_contents(&release_path, cache)
                    .await?;
                if let Some(keyring) = self.verification_keyring() {
                    let signature_path = join_paths(dist_root, "Release.gpg");
                    let (signature, _) = self
                        .url_source
                        .get_file_contents(&signature_path, cache)
                        .await?;
                    keyring
                        .verify_detached(&contents, &signature)
                        .await
                        .map_err(|e| ListError::failed(&uri, e.to_string()))?;
                }
                parse_release(&contents).map_err(|e| ListError::failed(&uri, e.to_string()))
            }
        }
    }

    fn verification_keyring(&self) -> Option<&Arc<GpgKeyring>> {
        if self.verify_signature {
            self.keyring.as_ref()
        } else {
            None
        }
    }

    /// Enumerate all files of one distribution, in transfer order
    async fn list_dist_files(
        &self,
        dist_root: &str,
        cache: &mut HashMap<String, FileSpec>,
    ) -> std::result::Result<Vec<String>, ListError> {
        let release = self.fetch_release(dist_root, cache).await?;

        let architectures = if self.architectures.is_empty() {
            release.architectures.clone()
        } else {
            self.architectures.clone()
        };

        let mut dist_files = Vec::new();

        // some repositories publish every index a second time under a
        // content-addressed `by-hash/` location; mirror those as well
        if release.acquire_by_hash {
            self.collect_by_hash_files(dist_root, &release.components, &architectures, &mut dist_files)
                .await?;
        }

        // several compression variants of the same index may be listed; the
        // stems let us parse each index once, preferring the xz variant
        let mut package_index_stems = Vec::new();
        let mut source_index_stems = Vec::new();
        let mut seen_stems = HashSet::new();

        for entry in &release.sha256_entries {
            let file_name = join_paths(dist_root, &entry.filename);

            // architecture-independent indexes
            if entry.filename.ends_with("Sources.gz") || entry.filename.ends_with("Sources.xz") {
                dist_files.push(file_name.clone());
                let stem = strip_extension(&file_name);
                if seen_stems.insert(stem.clone()) {
                    source_index_stems.push(stem);
                }
                continue;
            }
            if TRANSLATION_ENTRY_RX.is_match(&entry.filename) {
                dist_files.push(file_name.clone());
                continue;
            }

            // architecture-specific indexes
            for architecture in &architectures {
                if let Some(captures) = CONTENTS_ENTRY_RX.captures(&entry.filename) {
                    if captures.get(4).map(|m| m.as_str()) == Some(architecture) {
                        dist_files.push(file_name.clone());
                    }
                } else if let Some(captures) = DEP11_ENTRY_RX.captures(&entry.filename) {
                    match captures.get(6) {
                        // Components-<arch>.yml
                        Some(arch) if arch.as_str() == architecture => {
                            dist_files.push(file_name.clone());
                        }
                        Some(_) => {}
                        // icon archives are architecture-independent
                        None => dist_files.push(file_name.clone()),
                    }
                } else if let Some(captures) = PACKAGES_ENTRY_RX.captures(&entry.filename) {
                    if captures.get(3).map(|m| m.as_str()) == Some(architecture) {
                        dist_files.push(file_name.clone());
                        let stem = strip_extension(&file_name);
                        if seen_stems.insert(stem.clone()) {
                            package_index_stems.push(stem);
                        }
                    }
                }
            }
        }

        // walk the Packages indexes to find the .deb files
        for stem in &package_index_stems {
            let (paragraphs, _) = self.fetch_index_with_fallback(stem, cache).await?;
            for paragraph in &paragraphs {
                if let Some(filename) = paragraph.get("Filename") {
                    dist_files.push(filename.to_string());
                }
            }
        }

        // walk the Sources indexes to find .dsc/.tar.* source artifacts
        for stem in &source_index_stems {
            let (paragraphs, _) = self.fetch_index_with_fallback(stem, cache).await?;
            for paragraph in &paragraphs {
                let Some(directory) = paragraph.get("Directory") else {
                    continue;
                };
                for file in paragraph.get_file_list("Files") {
                    dist_files.push(join_paths(directory, &file.filename));
                }
            }
        }

        // the Release trio goes at the very end, after everything it
        // references has been uploaded
        dist_files.push(join_paths(dist_root, "InRelease"));
        dist_files.push(join_paths(dist_root, "Release"));
        dist_files.push(join_paths(dist_root, "Release.gpg"));

        Ok(dist_files)
    }

    /// Fetch an index, preferring the `.xz` variant and falling back to
    /// `.gz` for older repositories
    async fn fetch_index_with_fallback(
        &self,
        stem: &str,
        cache: &mut HashMap<String, FileSpec>,
    ) -> std::result::Result<(Vec<Paragraph>, String), ListError> {
        match self.download_and_parse_dcf(&format!("{stem}.xz"), cache).await {
            Ok(result) => Ok(result),
            Err(_) => self.download_and_parse_dcf(&format!("{stem}.gz"), cache).await,
        }
    }

    async fn collect_by_hash_files(
        &self,
        dist_root: &str,
        components: &[String],
        architectures: &[String],
        dist_files: &mut Vec<String>,
    ) -> std::result::Result<(), ListError> {
        let mut directories = vec![join_paths(dist_root, "by-hash")];
        for component in components {
            for architecture in architectures {
                directories.push(join_paths(
                    dist_root,
                    &format!("{component}/binary-{architecture}/by-hash"),
                ));
                directories.push(join_paths(
                    dist_root,
                    &format!("{component}/debian-installer/binary-{architecture}/by-hash"),
                ));
            }
            directories.push(join_paths(dist_root, &format!("{component}/dep11/by-hash")));
            directories.push(join_paths(dist_root, &format!("{component}/i18n/by-hash")));
            directories.push(join_paths(dist_root, &format!("{component}/source/by-hash")));
        }

        for directory in directories {
            self.recursively_list_entries(&directory, dist_files).await?;
        }
        Ok(())
    }

    /// Collect every file below `path` by walking the directory listings
    async fn recursively_list_entries(
        &self,
        path: &str,
        files: &mut Vec<String>,
    ) -> std::result::Result<(), ListError> {
        let mut pending = vec![path.to_string()];
        while let Some(directory) = pending.pop() {
            for entry in self.url_source.list_entries(&directory).await? {
                if entry.is_directory {
                    pending.push(entry.path);
                } else {
                    files.push(entry.path);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Source for DebianSource {
    fn validate(&mut self, name: &str) -> Vec<Error> {
        self.verify_signature = self.verify_signature_in.unwrap_or(true);
        self.url_source.validate(name)
    }

    async fn connect(&mut self) -> crate::error::Result<()> {
        self.url_source.connect_client()
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        if self.distributions.is_empty() {
            return Err(ListError::failed(
                &self.url_source.url_string,
                "no distributions specified in the config file",
            ));
        }

        let mut cache = HashMap::new();

        // package and source files of different distributions share the
        // common pool/ directory, so keep the file list duplicate-free
        let mut all_files = Vec::new();
        let mut unique_files = HashSet::new();

        for dist_name in &self.distributions {
            let dist_root = join_paths("dists", dist_name);
            let dist_files = self.list_dist_files(&dist_root, &mut cache).await?;
            append_unique(&mut all_files, &mut unique_files, dist_files);
        }

        Ok(assemble_file_specs(all_files, cache))
    }

    async fn list_entries(
        &self,
        directory_path: &str,
    ) -> std::result::Result<Vec<FileSpec>, ListError> {
        let location = self
            .url_source
            .url_for_path(directory_path)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| directory_path.to_string());
        Err(ListError::failed(
            location,
            "ListEntries is not implemented for Debian sources",
        ))
    }

    async fn get_file(
        &self,
        spec: &FileSpec,
        conditions: &GetConditions,
    ) -> crate::error::Result<(Option<FileBody>, FileState)> {
        self.url_source.get_file(spec, conditions).await
    }
}

/// Parse the fields of interest out of a Release/InRelease control file
fn parse_release(message: &[u8]) -> crate::error::Result<ReleaseInfo> {
    let text = std::str::from_utf8(message)
        .map_err(|e| Error::Parse(format!("Release file is not valid UTF-8: {e}")))?;
    let paragraph = dcf::parse_single(text)?;
    Ok(ReleaseInfo {
        architectures: paragraph.get_words("Architectures"),
        components: paragraph.get_words("Components"),
        acquire_by_hash: paragraph.get_bool("Acquire-By-Hash"),
        sha256_entries: paragraph.get_file_list("SHA256"),
    })
}

/// Append `dist_files` to `all_files`, dropping paths that were already
/// seen. The first occurrence keeps its position, so a pool file shared by
/// several distributions is transferred before any of their Release files.
fn append_unique(
    all_files: &mut Vec<String>,
    unique_files: &mut HashSet<String>,
    dist_files: Vec<String>,
) {
    for file in dist_files {
        if unique_files.insert(file.clone()) {
            all_files.push(file);
        }
    }
}

/// Strip the final extension (".gz"/".xz") off an index path
fn strip_extension(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(position) if !file_name[position..].contains('/') => file_name[..position].to_string(),
        _ => file_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packages_entry_rx() {
        // adapted from the Release files of actual Debian and Ubuntu mirrors
        let table = [
            ("Packages", false),
            ("Packages.gz", false),
            ("arch64/Packages.gz", false),
            ("binary-arch64/Packages.gz", false),
            ("component/arch64/Packages.gz", false),
            ("component/binary.arch64/Packages.gz", false),
            ("component/debian.installer/binary-arch64/Packages.gz", false),
            ("debian-installer/binary-arch64/Packages.gz", false),
            ("component/binary-arch64/Packages.gz", true),
            ("component/binary-arch64/Packages.xz", true),
            ("component/debian-installer/binary-arch64/Packages.gz", true),
            ("component/debian-installer/binary-arch64/Packages.xz", true),
        ];
        for (input, expected) in table {
            assert_eq!(
                PACKAGES_ENTRY_RX.is_match(input),
                expected,
                "unexpected result for {input:?}"
            );
        }
    }

    #[test]
    fn test_packages_entry_rx_captures_arch() {
        let captures = PACKAGES_ENTRY_RX
            .captures("main/debian-installer/binary-amd64/Packages.xz")
            .unwrap();
        assert_eq!(captures.get(1).unwrap().as_str(), "main");
        assert_eq!(captures.get(3).unwrap().as_str(), "amd64");
    }

    #[test]
    fn test_contents_entry_rx() {
        let captures = CONTENTS_ENTRY_RX.captures("main/Contents-amd64.gz").unwrap();
        assert_eq!(captures.get(4).unwrap().as_str(), "amd64");
        let captures = CONTENTS_ENTRY_RX.captures("Contents-udeb-arm64.xz").unwrap();
        assert_eq!(captures.get(4).unwrap().as_str(), "arm64");
        assert!(!CONTENTS_ENTRY_RX.is_match("main/Contents-amd64"));
    }

    #[test]
    fn test_dep11_entry_rx() {
        let captures = DEP11_ENTRY_RX
            .captures("main/dep11/Components-amd64.yml.gz")
            .unwrap();
        assert_eq!(captures.get(6).unwrap().as_str(), "amd64");
        let captures = DEP11_ENTRY_RX.captures("main/dep11/icons-64x64.tar.gz").unwrap();
        assert!(captures.get(6).is_none());
    }

    #[test]
    fn test_translation_entry_rx() {
        assert!(TRANSLATION_ENTRY_RX.is_match("main/i18n/Index"));
        assert!(TRANSLATION_ENTRY_RX.is_match("main/i18n/Translation-en.xz"));
        assert!(TRANSLATION_ENTRY_RX.is_match("main/i18n/Translation-pt_BR.gz"));
        assert!(!TRANSLATION_ENTRY_RX.is_match("main/i18n/Translation-en"));
    }

    #[test]
    fn test_parse_release() {
        let release = parse_release(
            b"Architectures: amd64 arm64\n\
              Components: main universe\n\
              Acquire-By-Hash: yes\n\
              SHA256:\n \
              abc 123 main/binary-amd64/Packages.gz\n",
        )
        .unwrap();
        assert_eq!(release.architectures, vec!["amd64", "arm64"]);
        assert_eq!(release.components, vec!["main", "universe"]);
        assert!(release.acquire_by_hash);
        assert_eq!(release.sha256_entries.len(), 1);
    }

    #[test]
    fn test_pool_files_are_emitted_once_across_distributions() {
        // both distributions reference the same pool file; the Release trio
        // of each distribution stays at the end of its group
        let focal = vec![
            "pool/main/x/xz-utils.deb".to_string(),
            "dists/focal/InRelease".to_string(),
            "dists/focal/Release".to_string(),
            "dists/focal/Release.gpg".to_string(),
        ];
        let jammy = vec![
            "pool/main/x/xz-utils.deb".to_string(),
            "dists/jammy/InRelease".to_string(),
            "dists/jammy/Release".to_string(),
            "dists/jammy/Release.gpg".to_string(),
        ];

        let mut all_files = Vec::new();
        let mut unique_files = HashSet::new();
        append_unique(&mut all_files, &mut unique_files, focal);
        append_unique(&mut all_files, &mut unique_files, jammy);

        let pool_count = all_files
            .iter()
            .filter(|path| path.as_str() == "pool/main/x/xz-utils.deb")
            .count();
        assert_eq!(pool_count, 1);
        assert_eq!(
            all_files,
            vec![
                "pool/main/x/xz-utils.deb",
                "dists/focal/InRelease",
                "dists/focal/Release",
                "dists/focal/Release.gpg",
                "dists/jammy/InRelease",
                "dists/jammy/Release",
                "dists/jammy/Release.gpg",
            ]
        );
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(
            strip_extension("dists/jammy/main/binary-amd64/Packages.gz"),
            "dists/jammy/main/binary-amd64/Packages"
        );
        assert_eq!(strip_extension("no-extension"), "no-extension");
        assert_eq!(strip_extension("dir.d/file"), "dir.d/file");
    }
}
