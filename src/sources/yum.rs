// src/sources/yum.rs

//! Yum repositories as a source.
//!
//! Instead of relying on directory listings, this source walks the
//! repository metadata: `repodata/repomd.xml` names the index files, the
//! `primary` index names the RPMs, and `prestodelta` (or SUSE's `deltainfo`)
//! names the delta RPMs.
//!
//! The emission order matters for mirror consistency: `repomd.xml` is placed
//! at the very end, so a reader of the half-finished mirror never sees
//! repository metadata that references packages which have not been uploaded
//! yet. Index files downloaded during scraping are passed along with their
//! contents, which also pins the uploaded metadata to the exact package list
//! that was scraped.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use super::http::UrlSource;
use super::{
    assemble_file_specs, FileBody, FileSpec, FileState, GetConditions, ListError, Source,
};
use crate::compression::decompress_auto;
use crate::error::{Error, Result};

const REPOMD_PATH: &str = "repodata/repomd.xml";

/// A `UrlSource` containing a Yum repository
#[derive(Clone, Default, Deserialize)]
pub struct YumSource {
    #[serde(flatten)]
    pub url_source: UrlSource,
    /// Architecture allow-list; an empty list mirrors all architectures
    #[serde(default, rename = "arch")]
    pub architectures: Vec<String>,
}

impl YumSource {
    fn wants_architecture(&self, architecture: &str) -> bool {
        self.architectures.is_empty()
            || self.architectures.iter().any(|a| a == architecture)
    }

    /// Download one metadata file, remember it in the cache, decompress it
    /// if necessary, and return the XML text
    async fn download_index(
        &self,
        path: &str,
        cache: &mut HashMap<String, FileSpec>,
    ) -> std::result::Result<(String, String), ListError> {
        let (contents, uri) = self.url_source.get_file_contents(path, cache).await?;
        let decompressed = decompress_auto(&contents)
            .map_err(|e| ListError::failed(&uri, format!("error while decompressing: {e}")))?;
        let text = String::from_utf8(decompressed)
            .map_err(|e| ListError::failed(&uri, format!("index is not valid UTF-8: {e}")))?;
        Ok((text, uri))
    }
}

#[async_trait]
impl Source for YumSource {
    fn validate(&mut self, name: &str) -> Vec<Error> {
        self.url_source.validate(name)
    }

    async fn connect(&mut self) -> Result<()> {
        self.url_source.connect_client()
    }

    async fn list_all_files(&self) -> std::result::Result<Vec<FileSpec>, ListError> {
        let mut cache = HashMap::new();

        let (repomd_xml, repomd_uri) = self.download_index(REPOMD_PATH, &mut cache).await?;
        let index_entries = parse_repomd(&repomd_xml)
            .map_err(|message| ListError::failed(&repomd_uri, message))?;

        // all index files are transferred too
        let mut all_files: Vec<String> =
            index_entries.iter().map(|entry| entry.href.clone()).collect();

        let hrefs_by_type: HashMap<&str, &str> = index_entries
            .iter()
            .map(|entry| (entry.data_type.as_str(), entry.href.as_str()))
            .collect();

        let primary_href = hrefs_by_type.get("primary").copied().ok_or_else(|| {
            ListError::failed(&repomd_uri, "cannot find link to the primary index in repomd.xml")
        })?;
        let (primary_xml, primary_uri) = self.download_index(primary_href, &mut cache).await?;
        let packages =
            parse_primary(&primary_xml).map_err(|message| ListError::failed(&primary_uri, message))?;
        for package in packages {
            if self.wants_architecture(&package.architecture) {
                all_files.push(package.href);
            }
        }

        // delta RPM index, where present (prestodelta on Fedora/RHEL,
        // deltainfo on SUSE)
        let delta_href = hrefs_by_type
            .get("prestodelta")
            .or_else(|| hrefs_by_type.get("deltainfo"))
            .copied();
        if let Some(href) = delta_href {
            let (delta_xml, delta_uri) = self.download_index(href, &mut cache).await?;
            let deltas = parse_delta_index(&delta_xml)
                .map_err(|message| ListError::failed(&delta_uri, message))?;
            all_files.extend(deltas);
        }

        // repomd.xml goes at the very end, after everything it references
        all_files.push(REPOMD_PATH.to_string());

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
            "ListEntries is not implemented for Yum sources",
        ))
    }

    async fn get_file(
        &self,
        spec: &FileSpec,
        conditions: &GetConditions,
    ) -> Result<(Option<FileBody>, FileState)> {
        self.url_source.get_file(spec, conditions).await
    }
}

/// One `<data>` entry of a repomd.xml file
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RepomdEntry {
    pub data_type: String,
    pub href: String,
}

/// One `<package>` entry of a primary index
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PrimaryPackage {
    pub architecture: String,
    pub href: String,
}

/// Parse repomd.xml into its index file entries
pub(crate) fn parse_repomd(xml: &str) -> std::result::Result<Vec<RepomdEntry>, String> {
    let document =
        roxmltree::Document::parse(xml).map_err(|e| format!("error while parsing XML: {e}"))?;

    let mut entries = Vec::new();
    for data in document
        .descendants()
        .filter(|node| node.tag_name().name() == "data")
    {
        let Some(data_type) = data.attribute("type") else {
            continue;
        };
        let href = data
            .children()
            .find(|node| node.tag_name().name() == "location")
            .and_then(|node| node.attribute("href"));
        if let Some(href) = href {
            entries.push(RepomdEntry {
                data_type: data_type.to_string(),
                href: href.to_string(),
            });
        }
    }
    Ok(entries)
}

/// Parse a primary index into its package entries
pub(crate) fn parse_primary(xml: &str) -> std::result::Result<Vec<PrimaryPackage>, String> {
    let document =
        roxmltree::Document::parse(xml).map_err(|e| format!("error while parsing XML: {e}"))?;

    let mut packages = Vec::new();
    for package in document
        .descendants()
        .filter(|node| node.tag_name().name() == "package")
    {
        let architecture = package
            .children()
            .find(|node| node.tag_name().name() == "arch")
            .and_then(|node| node.text())
            .unwrap_or_default();
        let href = package
            .children()
            .find(|node| node.tag_name().name() == "location")
            .and_then(|node| node.attribute("href"));
        if let Some(href) = href {
            packages.push(PrimaryPackage {
                architecture: architecture.trim().to_string(),
                href: href.to_string(),
            });
        }
    }
    Ok(packages)
}

/// Parse a prestodelta/deltainfo index into delta RPM paths
pub(crate) fn parse_delta_index(xml: &str) -> std::result::Result<Vec<String>, String> {
    let document =
        roxmltree::Document::parse(xml).map_err(|e| format!("error while parsing XML: {e}"))?;

    let mut files = Vec::new();
    for newpackage in document
        .descendants()
        .filter(|node| node.tag_name().name() == "newpackage")
    {
        for filename in newpackage
            .descendants()
            .filter(|node| node.tag_name().name() == "filename")
        {
            if let Some(text) = filename.text() {
                let text = text.trim();
                if !text.is_empty() {
                    files.push(text.to_string());
                }
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="primary">
    <location href="repodata/primary.xml.gz"/>
  </data>
  <data type="filelists">
    <location href="repodata/filelists.xml.gz"/>
  </data>
  <data type="prestodelta">
    <location href="repodata/prestodelta.xml.gz"/>
  </data>
</repomd>"#;

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common">
  <package type="rpm">
    <arch>x86_64</arch>
    <location href="Packages/x86_64/foo-1.rpm"/>
  </package>
  <package type="rpm">
    <arch>aarch64</arch>
    <location href="Packages/aarch64/foo-1.rpm"/>
  </package>
  <package type="rpm">
    <arch>src</arch>
    <location href="Packages/src/foo-1.src.rpm"/>
  </package>
</metadata>"#;

    const PRESTODELTA: &str = r#"<?xml version="1.0"?>
<prestodelta>
  <newpackage name="foo" arch="x86_64">
    <delta oldepoch="0">
      <filename>drpms/foo-0_1.drpm</filename>
    </delta>
  </newpackage>
</prestodelta>"#;

    #[test]
    fn test_parse_repomd() {
        let entries = parse_repomd(REPOMD).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].data_type, "primary");
        assert_eq!(entries[0].href, "repodata/primary.xml.gz");
        assert_eq!(entries[2].data_type, "prestodelta");
    }

    #[test]
    fn test_parse_primary() {
        let packages = parse_primary(PRIMARY).unwrap();
        assert_eq!(packages.len(), 3);
        assert_eq!(packages[0].architecture, "x86_64");
        assert_eq!(packages[0].href, "Packages/x86_64/foo-1.rpm");
    }

    #[test]
    fn test_parse_delta_index() {
        let deltas = parse_delta_index(PRESTODELTA).unwrap();
        assert_eq!(deltas, vec!["drpms/foo-0_1.drpm"]);
    }

    #[test]
    fn test_architecture_filter() {
        let source = YumSource {
            architectures: vec!["x86_64".to_string()],
            ..YumSource::default()
        };
        assert!(source.wants_architecture("x86_64"));
        assert!(!source.wants_architecture("aarch64"));

        let all = YumSource::default();
        assert!(all.wants_architecture("aarch64"));
    }

    #[test]
    fn test_assemble_keeps_cached_contents() {
        let mut cache = HashMap::new();
        cache.insert(
            "repodata/repomd.xml".to_string(),
            FileSpec {
                path: "repodata/repomd.xml".to_string(),
                contents: Some(bytes::Bytes::from_static(b"<repomd/>")),
                ..FileSpec::default()
            },
        );
        let specs = assemble_file_specs(
            vec![
                "Packages/x86_64/foo-1.rpm".to_string(),
                "repodata/repomd.xml".to_string(),
            ],
            cache,
        );
        assert_eq!(specs.len(), 2);
        assert!(specs[0].contents.is_none());
        assert!(specs[1].contents.is_some());
        // metadata comes after the packages it references
        assert_eq!(specs[1].path, "repodata/repomd.xml");
    }

    #[test]
    fn test_parse_errors_are_reported() {
        assert!(parse_repomd("this is not xml").is_err());
    }
}
