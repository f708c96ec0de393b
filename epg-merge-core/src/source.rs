//! Source references and the source list loader.
//!
//! A reference is resolved once, at load time, into [`SourceRef::Remote`] or
//! [`SourceRef::Local`]; nothing downstream re-inspects the raw string.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, DEFAULT_FALLBACK_PATTERN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceRef {
    Remote { url: String },
    Local { path: PathBuf },
}

/// True for references that name an `http(s)://` URL.
pub fn is_remote(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

impl SourceRef {
    /// Parses one list entry. Blank lines and `#` comments yield `None`, as do
    /// URLs that do not parse.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }
        if is_remote(raw) {
            return match reqwest::Url::parse(raw) {
                Ok(url) => Some(SourceRef::Remote {
                    url: url.to_string(),
                }),
                Err(e) => {
                    warn!(reference = raw, error = %e, "Ignoring malformed source URL");
                    None
                }
            };
        }
        Some(SourceRef::Local {
            path: PathBuf::from(raw),
        })
    }

    pub fn remote(url: impl Into<String>) -> Self {
        SourceRef::Remote { url: url.into() }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        SourceRef::Local { path: path.into() }
    }

    /// Whether the reference itself signals a gzip payload (`.gz` suffix,
    /// ignoring any URL query string).
    pub fn has_gzip_suffix(&self) -> bool {
        match self {
            SourceRef::Remote { url } => reqwest::Url::parse(url)
                .map(|u| u.path().ends_with(".gz"))
                .unwrap_or_else(|_| url.ends_with(".gz")),
            SourceRef::Local { path } => path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("gz"))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Remote { url } => write!(f, "{url}"),
            SourceRef::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Parses a source list text. Relative local paths are joined onto `base_dir`
/// when one is given.
pub fn parse_source_list(text: &str, base_dir: Option<&Path>) -> Vec<SourceRef> {
    text.lines()
        .filter_map(SourceRef::parse)
        .map(|source| match (source, base_dir) {
            (SourceRef::Local { path }, Some(base)) if path.is_relative() => SourceRef::Local {
                path: base.join(path),
            },
            (source, _) => source,
        })
        .collect()
}

/// Reads a source list file. Read errors are logged and produce an empty list.
pub fn read_source_list(path: &Path) -> Vec<SourceRef> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let sources = parse_source_list(&text, path.parent());
            info!(
                path = %path.display(),
                count = sources.len(),
                "Read source list"
            );
            sources
        }
        Err(e) => {
            error!(error = ?e, path = %path.display(), "Failed to read source list");
            Vec::new()
        }
    }
}

/// Lists files in `dir` (non-recursive) whose name matches `pattern`, in
/// directory-listing order.
pub fn scan_directory(dir: &Path, pattern: &Regex) -> Vec<SourceRef> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = ?e, dir = %dir.display(), "Failed to scan fallback directory");
            return Vec::new();
        }
    };
    let mut sources = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|name| pattern.is_match(name))
            .unwrap_or(false);
        if matches {
            debug!(path = %path.display(), "Fallback scan picked up file");
            sources.push(SourceRef::Local { path });
        }
    }
    sources
}

fn fallback_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "Invalid fallback pattern, using default");
            Regex::new(DEFAULT_FALLBACK_PATTERN).ok()
        }
    }
}

/// Resolves the ordered primary source list: inline entries, then the list file,
/// then (only if both were empty) the fallback directory scan.
pub fn load_sources(config: &PipelineConfig) -> Vec<SourceRef> {
    let mut sources: Vec<SourceRef> = config
        .sources
        .iter()
        .filter_map(|raw| SourceRef::parse(raw))
        .collect();

    if let Some(list) = &config.source_list {
        sources.extend(read_source_list(list));
    }

    if sources.is_empty() {
        if let Some(dir) = &config.fallback_dir {
            info!(dir = %dir.display(), "No sources listed, scanning fallback directory");
            if let Some(pattern) = fallback_regex(&config.fallback_pattern) {
                sources = scan_directory(dir, &pattern);
            }
        }
    }

    info!(count = sources.len(), "Resolved primary source list");
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_classifies_references_once() {
        assert_eq!(
            SourceRef::parse("  https://i.mjh.nz/Plex/all.xml  "),
            Some(SourceRef::remote("https://i.mjh.nz/Plex/all.xml"))
        );
        assert_eq!(
            SourceRef::parse("./www/dummy.xml"),
            Some(SourceRef::local("./www/dummy.xml"))
        );
        assert_eq!(SourceRef::parse(""), None);
        assert_eq!(SourceRef::parse("   "), None);
        assert_eq!(SourceRef::parse("# https://commented.out/x.xml"), None);
        assert_eq!(SourceRef::parse("http://"), None);
    }

    #[test]
    fn gzip_suffix_ignores_query_string() {
        assert!(SourceRef::remote("https://x.test/epg.xml.gz?token=1").has_gzip_suffix());
        assert!(!SourceRef::remote("https://x.test/epg.xml?f=a.gz").has_gzip_suffix());
        assert!(SourceRef::local("guide.xml.GZ").has_gzip_suffix());
        assert!(!SourceRef::local("guide.xml").has_gzip_suffix());
    }

    #[test]
    fn list_text_skips_comments_and_rebases_relative_paths() {
        let text = "# primary\nhttps://a.test/one.xml\n\nlocal/two.xml\n/abs/three.xml\n";
        let sources = parse_source_list(text, Some(Path::new("/srv/lists")));
        assert_eq!(
            sources,
            vec![
                SourceRef::remote("https://a.test/one.xml"),
                SourceRef::local("/srv/lists/local/two.xml"),
                SourceRef::local("/abs/three.xml"),
            ]
        );
    }
}
