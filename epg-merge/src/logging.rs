//! Tracing subscriber setup for the binary.
//!
//! Console output goes through a `fmt` layer (stdout, or stderr when stdout is
//! reserved for the JSON report). An optional second layer writes the same events
//! without ANSI colours to a log file, which is truncated when the run starts.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. Filtering follows `RUST_LOG`, defaulting to
/// `info`.
pub fn init(log_file: Option<&Path>, console_to_stderr: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_writer = if console_to_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let file_layer = match log_file.map(open_log_file) {
        Some(Ok(file)) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        ),
        Some(Err(e)) => {
            eprintln!("Cannot open log file, logging to console only: {e}");
            None
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(console_writer))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}
