/// `load_config` module: reads the YAML config file into a [`CliConfig`].
///
/// This is the only place where the YAML schema is parsed. Every relative path in
/// the file is resolved against the directory holding the config file, so a run
/// behaves the same whatever the working directory of the scheduler that starts it.
///
/// # Errors
/// All errors use `anyhow::Error` and surface at the CLI boundary.
///
/// For the accepted schema, see the README.
use anyhow::Result;
use epg_merge_core::config::PipelineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Plain-text copy of the log, truncated at the start of every run.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
}

fn config_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let mut config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let base = config_dir(path_ref);
    config.pipeline.resolve_relative_to(&base);
    if let Some(log_file) = &mut config.log_file {
        if log_file.is_relative() {
            *log_file = base.join(&*log_file);
        }
    }
    Ok(config)
}

/// Reads only `log_file` from the config, without logging. Used to set up the
/// log file before the real load; any problem here resurfaces in [`load_config`].
pub fn peek_log_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    #[derive(Deserialize)]
    struct LogOnly {
        #[serde(default)]
        log_file: Option<PathBuf>,
    }

    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).ok()?;
    let log_file = serde_yaml::from_str::<LogOnly>(&content).ok()?.log_file?;
    if log_file.is_relative() {
        Some(config_dir(path_ref).join(log_file))
    } else {
        Some(log_file)
    }
}
