//! Persistence: writes the merged document to its canonical path.
//!
//! Before writing, the parent directory is created if missing and the directory
//! and any existing target are made owner-writable. The document is written to a
//! temp file in the same directory and renamed over the target, so readers (for
//! instance a web server) never observe a half-written guide.
//!
//! The success line contains the fixed text `EPG file successfully saved`; external
//! health checks grep the log for it.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::document::{Document, DocumentError};

pub const SAVE_SUCCESS_MARKER: &str = "EPG file successfully saved";
pub const SAVE_FAILURE_MARKER: &str = "EPG file save failed";

#[cfg(unix)]
const OUTPUT_FILE_MODE: u32 = 0o644;
#[cfg(unix)]
const DIR_OWNER_BITS: u32 = 0o700;
#[cfg(unix)]
const FILE_OWNER_BITS: u32 = 0o600;

#[derive(Debug)]
pub enum SaveError {
    CreateDir { path: PathBuf, source: io::Error },
    Permissions { path: PathBuf, source: io::Error },
    Serialize(DocumentError),
    Write { path: PathBuf, source: io::Error },
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::CreateDir { path, source } => {
                write!(f, "cannot create directory {}: {source}", path.display())
            }
            SaveError::Permissions { path, source } => {
                write!(f, "cannot fix permissions on {}: {source}", path.display())
            }
            SaveError::Serialize(e) => write!(f, "{e}"),
            SaveError::Write { path, source } => {
                write!(f, "cannot write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SaveError {}

impl From<DocumentError> for SaveError {
    fn from(e: DocumentError) -> Self {
        SaveError::Serialize(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedFile {
    pub path: PathBuf,
    pub bytes: usize,
    pub saved_at: String,
}

/// Serialises `document` to `path`, logging the outcome either way.
pub fn save(document: &Document, path: &Path) -> Result<SavedFile, SaveError> {
    match write_document(document, path) {
        Ok(bytes) => {
            let saved_at = Local::now().format("%b %d %Y %H:%M:%S").to_string();
            info!(
                path = %path.display(),
                bytes,
                saved_at = %saved_at,
                "[SAVE] {SAVE_SUCCESS_MARKER} to {} at {saved_at}",
                path.display()
            );
            Ok(SavedFile {
                path: path.to_path_buf(),
                bytes,
                saved_at,
            })
        }
        Err(e) => {
            error!(
                path = %path.display(),
                error = ?e,
                "[SAVE] {SAVE_FAILURE_MARKER}: {e}"
            );
            Err(e)
        }
    }
}

/// Parent directory of `path`, treating a bare file name as the current directory.
fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Creates the parent directory if missing and grants the owner write access to
/// it and to an existing `path`.
pub fn ensure_writable(path: &Path) -> Result<(), SaveError> {
    let dir = parent_dir(path);
    if !dir.is_dir() {
        info!(dir = %dir.display(), "[SAVE] Output directory does not exist, creating it");
        fs::create_dir_all(dir).map_err(|source| SaveError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    #[cfg(unix)]
    let (dir_bits, file_bits) = (DIR_OWNER_BITS, FILE_OWNER_BITS);
    #[cfg(not(unix))]
    let (dir_bits, file_bits) = (0, 0);

    if grant_owner_bits(dir, dir_bits).map_err(|source| SaveError::Permissions {
        path: dir.to_path_buf(),
        source,
    })? {
        warn!(dir = %dir.display(), "[SAVE] Output directory was not writable, updated permissions");
    }

    if path.exists()
        && grant_owner_bits(path, file_bits).map_err(|source| SaveError::Permissions {
            path: path.to_path_buf(),
            source,
        })?
    {
        warn!(path = %path.display(), "[SAVE] Output file was not writable, updated permissions");
    }
    Ok(())
}

/// Returns whether the mode had to change.
#[cfg(unix)]
fn grant_owner_bits(path: &Path, bits: u32) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    if mode & bits == bits {
        return Ok(false);
    }
    permissions.set_mode(mode | bits);
    fs::set_permissions(path, permissions)?;
    Ok(true)
}

#[cfg(not(unix))]
fn grant_owner_bits(path: &Path, _bits: u32) -> io::Result<bool> {
    let mut permissions = fs::metadata(path)?.permissions();
    if !permissions.readonly() {
        return Ok(false);
    }
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)?;
    Ok(true)
}

fn write_document(document: &Document, path: &Path) -> Result<usize, SaveError> {
    ensure_writable(path)?;
    let bytes = document.to_xml_bytes()?;
    let write_err = |source: io::Error| SaveError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(parent_dir(path)).map_err(write_err)?;
    tmp.write_all(&bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // NamedTempFile is created 0600; the guide is served to other users.
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(OUTPUT_FILE_MODE))
            .map_err(write_err)?;
    }

    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(bytes.len())
}
