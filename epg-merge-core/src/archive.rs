//! Archive extractor: unpacks `.gz` sidecars in a directory next to themselves.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

pub const ARCHIVE_SUFFIX: &str = ".gz";

/// Scans `directory` (non-recursive) for `*.gz` files and decompresses each into
/// a sibling with the suffix stripped, replacing any existing sibling. Returns the
/// produced paths. A corrupt archive is logged and skipped; the sibling is only
/// replaced once the whole archive decoded.
pub fn extract_archives(directory: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = ?e, dir = %directory.display(), "[EXTRACT] Cannot read archive directory");
            return Vec::new();
        }
    };

    let mut archives: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && target_for(path).is_some())
        .collect();
    // Sorted by name so archive merge order is stable across runs.
    archives.sort();

    let mut extracted = Vec::new();
    for archive in archives {
        let Some(target) = target_for(&archive) else {
            continue;
        };
        info!(archive = %archive.display(), "[EXTRACT] Extracting {}", archive.display());
        match extract_one(&archive, &target) {
            Ok(bytes) => {
                info!(
                    archive = %archive.display(),
                    target = %target.display(),
                    bytes,
                    "[EXTRACT] Extracted archive"
                );
                extracted.push(target);
            }
            Err(e) => {
                error!(
                    error = %e,
                    archive = %archive.display(),
                    "[EXTRACT] Failed to extract archive, skipping"
                );
            }
        }
    }
    if extracted.is_empty() {
        warn!(dir = %directory.display(), "[EXTRACT] No archives extracted");
    }
    extracted
}

/// `guide.xml.gz` -> `guide.xml`; `None` for anything without the suffix or
/// with nothing left once it is stripped.
fn target_for(archive: &Path) -> Option<PathBuf> {
    let name = archive.file_name()?.to_str()?;
    let stem = name.strip_suffix(ARCHIVE_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(archive.with_file_name(stem))
}

fn extract_one(archive: &Path, target: &Path) -> io::Result<u64> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut decoder = MultiGzDecoder::new(File::open(archive)?);
    let mut tmp = NamedTempFile::new_in(dir)?;
    let bytes = io::copy(&mut decoder, tmp.as_file_mut())?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_strips_only_the_gz_suffix() {
        assert_eq!(
            target_for(Path::new("/w/guide.xml.gz")),
            Some(PathBuf::from("/w/guide.xml"))
        );
        assert_eq!(target_for(Path::new("/w/guide.xml")), None);
        assert_eq!(target_for(Path::new("/w/.gz")), None);
    }
}
