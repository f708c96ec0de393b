/// CLI glue for epg-merge: argument parsing, config overrides and the async entrypoint.
///
/// All merge logic (fetching, merging, saving, publishing) lives in
/// [`epg_merge_core`]; this module only loads the config, applies command-line
/// overrides and hands a [`PipelineContext`] to [`pipeline::run`].
///
/// For programmatic or integration use, call [`run`] with a constructed [`Cli`].
use crate::load_config::{load_config, peek_log_file};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use epg_merge_core::pipeline::{self, PipelineContext, PipelineError, RunReport};
use std::path::PathBuf;

/// CLI for epg-merge: build one XMLTV guide out of many.
#[derive(Parser, Debug)]
#[clap(
    name = "epg-merge",
    version,
    about = "Fetch remote and local XMLTV guides and merge them into one programme guide"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch every configured source, merge, save and optionally publish
    Merge {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        #[clap(flatten)]
        overrides: MergeOverrides,
    },
}

/// Flags that take precedence over the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct MergeOverrides {
    /// Write the merged guide here instead of the configured `output`
    #[clap(long)]
    pub output: Option<PathBuf>,
    /// Also write the log to this file (truncated each run)
    #[clap(long)]
    pub log_file: Option<PathBuf>,
    /// Skip the publish step even if one is configured
    #[clap(long)]
    pub no_publish: bool,
    /// Move all channels ahead of all programmes before saving
    #[clap(long)]
    pub channels_first: bool,
    /// Keep only the first channel seen for each channel id
    #[clap(long)]
    pub dedupe_channels: bool,
    /// Number of sources fetched at once (1 = sequential with a pause)
    #[clap(long)]
    pub concurrency: Option<usize>,
    /// Print the run report as JSON on stdout; logs move to stderr
    #[clap(long)]
    pub json: bool,
}

impl Cli {
    /// Log file for this invocation: the flag, else `log_file` from the config.
    pub fn log_file(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Merge { config, overrides } => overrides
                .log_file
                .clone()
                .or_else(|| peek_log_file(config)),
        }
    }

    pub fn wants_json(&self) -> bool {
        match &self.command {
            Commands::Merge { overrides, .. } => overrides.json,
        }
    }
}

/// Process exit code for an error returned by [`run`]: `2` when no source could
/// be resolved, `1` for everything else.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<PipelineError>() {
        Some(PipelineError::NoSources) => 2,
        _ => 1,
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<RunReport> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Merge { config, overrides } => {
            let mut loaded = load_config(config)?;
            let pipeline_config = &mut loaded.pipeline;
            if let Some(output) = overrides.output {
                pipeline_config.output = output;
            }
            if let Some(concurrency) = overrides.concurrency {
                pipeline_config.fetch.concurrency = concurrency.max(1);
            }
            pipeline_config.merge.channels_first |= overrides.channels_first;
            pipeline_config.merge.dedupe_channels |= overrides.dedupe_channels;
            if overrides.json {
                pipeline_config.console = false;
            }
            pipeline_config.trace_loaded();

            let console = pipeline_config.console;
            let mut ctx = PipelineContext::from_config(loaded.pipeline)?;
            if overrides.no_publish {
                tracing::info!("Publishing disabled by --no-publish");
                ctx = ctx.without_publisher();
            }

            tracing::info!(command = "merge", "Starting merge");
            match pipeline::run(&ctx).await {
                Ok(report) => {
                    tracing::info!(
                        command = "merge",
                        run_id = %report.run_id,
                        succeeded = report.counts.succeeded,
                        failed = report.counts.failed,
                        "Merge complete"
                    );
                    if overrides.json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else if console {
                        println!(
                            "Merged {} channels and {} programmes from {} of {} sources into {}",
                            report.totals.channels,
                            report.totals.programmes,
                            report.counts.succeeded,
                            report.sources.len(),
                            report.output.display()
                        );
                    }
                    Ok(report)
                }
                Err(e) => {
                    tracing::error!(command = "merge", error = %e, "Merge failed");
                    Err(e.into())
                }
            }
        }
    }
}
