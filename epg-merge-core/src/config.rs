use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::retry::RetryPolicy;

pub const DEFAULT_FALLBACK_PATTERN: &str = r"\.xml$";

/// Everything one pipeline run needs to know, as read from the YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Canonical output path of the merged guide.
    pub output: PathBuf,
    /// Inline source references (URLs or paths), processed before `source_list`.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Text file with one reference per line.
    #[serde(default)]
    pub source_list: Option<PathBuf>,
    /// Scanned for guide files when the inline list and `source_list` yield nothing.
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
    #[serde(default = "default_fallback_pattern")]
    pub fallback_pattern: String,
    /// Directory whose `.gz` sidecars are unpacked and merged in a second pass.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    /// Mirror per-attempt lines to stdout.
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_secs: default_backoff_secs(),
            timeout_secs: default_timeout_secs(),
            pause_ms: default_pause_ms(),
            concurrency: default_concurrency(),
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            backoff: Duration::from_secs(self.backoff_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Move every `<channel>` ahead of every `<programme>` after absorbing.
    #[serde(default)]
    pub channels_first: bool,
    /// Drop channels whose id was already merged from an earlier source.
    #[serde(default)]
    pub dedupe_channels: bool,
}

/// An external command run before fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Commit-and-push of the saved guide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    pub repo_dir: PathBuf,
    /// Paths staged before committing; defaults to the output file.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_true")]
    pub push: bool,
}

fn default_fallback_pattern() -> String {
    DEFAULT_FALLBACK_PATTERN.to_string()
}
fn default_true() -> bool {
    true
}
fn default_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    5
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_pause_ms() -> u64 {
    500
}
fn default_concurrency() -> usize {
    1
}
fn default_remote() -> String {
    "origin".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}

impl PipelineConfig {
    /// A config with defaults everywhere except the output path.
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            sources: Vec::new(),
            source_list: None,
            fallback_dir: None,
            fallback_pattern: default_fallback_pattern(),
            archive_dir: None,
            lock_file: None,
            console: true,
            fetch: FetchConfig::default(),
            merge: MergeConfig::default(),
            stages: Vec::new(),
            publish: None,
        }
    }

    /// Rebase every relative filesystem path onto `base` (normally the config
    /// file's directory). URLs among `sources` are left alone.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.output);
        for path in [
            &mut self.source_list,
            &mut self.fallback_dir,
            &mut self.archive_dir,
            &mut self.lock_file,
        ]
        .into_iter()
        .flatten()
        {
            rebase(path);
        }
        for source in &mut self.sources {
            let trimmed = source.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || crate::source::is_remote(trimmed) {
                continue;
            }
            let path = Path::new(trimmed);
            if path.is_relative() {
                *source = base.join(path).to_string_lossy().into_owned();
            }
        }
        for stage in &mut self.stages {
            match &mut stage.working_dir {
                Some(dir) => rebase(dir),
                None => stage.working_dir = Some(base.to_path_buf()),
            }
        }
        if let Some(publish) = &mut self.publish {
            rebase(&mut publish.repo_dir);
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            output = %self.output.display(),
            inline_sources = self.sources.len(),
            source_list = ?self.source_list,
            archive_dir = ?self.archive_dir,
            attempts = self.fetch.attempts,
            concurrency = self.fetch.concurrency,
            stages = self.stages.len(),
            publish = self.publish.is_some(),
            "Loaded pipeline config"
        );
        debug!(?self, "Pipeline config loaded (full debug)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_rebased_but_urls_are_not() {
        let mut config = PipelineConfig::new("www/epg.xml");
        config.sources = vec![
            "https://example.com/guide.xml".into(),
            "local/a.xml".into(),
            "/abs/b.xml".into(),
        ];
        config.archive_dir = Some("www".into());
        config.stages.push(StageConfig {
            name: "dummy".into(),
            program: "true".into(),
            args: vec![],
            working_dir: None,
        });

        config.resolve_relative_to(Path::new("/srv/epg"));

        assert_eq!(config.output, PathBuf::from("/srv/epg/www/epg.xml"));
        assert_eq!(config.sources[0], "https://example.com/guide.xml");
        assert_eq!(config.sources[1], "/srv/epg/local/a.xml");
        assert_eq!(config.sources[2], "/abs/b.xml");
        assert_eq!(config.archive_dir, Some(PathBuf::from("/srv/epg/www")));
        assert_eq!(
            config.stages[0].working_dir,
            Some(PathBuf::from("/srv/epg"))
        );
    }

    #[test]
    fn commented_out_sources_stay_comments() {
        let mut config = PipelineConfig::new("www/epg.xml");
        config.sources = vec!["# disabled/old.xml".into(), "  #retired.xml".into()];

        config.resolve_relative_to(Path::new("/srv/epg"));

        assert_eq!(config.sources[0], "# disabled/old.xml");
        assert_eq!(config.sources[1], "  #retired.xml");
        assert!(config
            .sources
            .iter()
            .all(|s| crate::source::SourceRef::parse(s).is_none()));
    }
}
