// src/dcf.rs

//! Debian Control File parsing.
//!
//! `Release`, `Packages` and `Sources` indexes all share the same stanza
//! format: paragraphs separated by blank lines, `Key: value` fields, and
//! continuation lines that start with a space or tab. This parser is
//! deliberately small; it keeps values verbatim and leaves interpretation
//! (file lists, space-separated word lists) to accessor helpers.

use crate::error::{Error, Result};

/// One parsed control-file paragraph.
///
/// Field names are looked up case-insensitively, matching how apt treats
/// them.
#[derive(Debug, Default, Clone)]
pub struct Paragraph {
    fields: Vec<(String, String)>,
}

impl Paragraph {
    /// Get a field value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Get a field as a list of whitespace-separated words
    pub fn get_words(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Get a boolean field ("yes"/"no")
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some(value) if value.trim().eq_ignore_ascii_case("yes"))
    }

    /// Parse a multi-line checksum field (`SHA256`, `Files`) into entries.
    ///
    /// Each continuation line has the form `<checksum> <size> <filename>`;
    /// malformed lines are skipped.
    pub fn get_file_list(&self, name: &str) -> Vec<FileListEntry> {
        let Some(value) = self.get(name) else {
            return Vec::new();
        };
        value
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let checksum = parts.next()?;
                let size: u64 = parts.next()?.parse().ok()?;
                let filename = parts.next()?;
                Some(FileListEntry {
                    checksum: checksum.to_string(),
                    size,
                    filename: filename.to_string(),
                })
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One entry of a checksum file list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListEntry {
    pub checksum: String,
    pub size: u64,
    pub filename: String,
}

/// Parse a control file into its paragraphs
pub fn parse(input: &str) -> Result<Vec<Paragraph>> {
    let mut paragraphs = Vec::new();
    let mut current = Paragraph::default();

    for line in input.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation of the previous field
            let Some((_, value)) = current.fields.last_mut() else {
                return Err(Error::Parse(format!(
                    "control file continuation line without a field: {line:?}"
                )));
            };
            if !value.is_empty() {
                value.push('\n');
            }
            value.push_str(line.trim());
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::Parse(format!(
                "malformed control file line: {line:?}"
            )));
        };
        current
            .fields
            .push((key.trim().to_string(), value.trim().to_string()));
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs)
}

/// Parse a control file that is expected to contain exactly one paragraph
/// (e.g. `Release`)
pub fn parse_single(input: &str) -> Result<Paragraph> {
    parse(input)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Parse("control file contains no paragraphs".to_string()))
}
