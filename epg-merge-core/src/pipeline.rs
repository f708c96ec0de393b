//! Orchestration of one merge run.
//!
//! A run moves through the states of [`RunState`]:
//! `Idle → LoadingSources → FetchingSources(n) → Accumulating → ExtractingArchives →
//! Persisting → {Published | PersistFailed} → Done`.
//!
//! Everything a run needs lives in a [`PipelineContext`] built by the caller, so a
//! test can swap the transport, stages and publisher for mocks. Per-source failures
//! never escape [`run`]; only a held lock, an empty source set or a failed save do.
//!
//! # Concurrency
//! With `fetch.concurrency <= 1` sources are fetched one at a time with
//! `fetch.pause_ms` between them. Above that, up to `concurrency` fetches are in
//! flight at once, but outcomes are still accumulated in source order.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accumulate::{MergeAccumulator, MergeTotals, OutcomeCounts};
use crate::archive::extract_archives;
use crate::config::{FetchConfig, PipelineConfig};
use crate::contract::{FetchOutcome, PublishOutcome, Publisher, Stage, Transport, TransportError};
use crate::download::{DocumentFetcher, ReqwestTransport, SourcePosition};
use crate::lock::{LockError, RunLock};
use crate::persist::{save, SaveError};
use crate::preprocess::{run_stages, CommandStage};
use crate::publish::GitPublisher;
use crate::source::{load_sources, SourceRef};

/// Label format handed to the publisher, e.g. `Feb 06, 2025 01:30:00 PM`.
const PUBLISH_LABEL_FORMAT: &str = "%b %d, %Y %I:%M:%S %p";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    LoadingSources,
    FetchingSources(usize),
    Accumulating,
    ExtractingArchives,
    Persisting,
    Published,
    PersistFailed,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::FetchingSources(n) => write!(f, "FetchingSources({n})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug)]
pub enum PipelineError {
    /// Neither the source list, the fallback scan nor the archive directory
    /// produced a single source.
    NoSources,
    Lock(LockError),
    Save(SaveError),
    Transport(TransportError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NoSources => write!(f, "no sources could be resolved"),
            PipelineError::Lock(e) => write!(f, "{e}"),
            PipelineError::Save(e) => write!(f, "{e}"),
            PipelineError::Transport(e) => write!(f, "cannot build HTTP client: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<LockError> for PipelineError {
    fn from(e: LockError) -> Self {
        PipelineError::Lock(e)
    }
}

impl From<SaveError> for PipelineError {
    fn from(e: SaveError) -> Self {
        PipelineError::Save(e)
    }
}

/// Which pass picked a source up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePass {
    Primary,
    Archive,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: SourceRef,
    pub pass: SourcePass,
    pub outcome: &'static str,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<MergeTotals>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    Published,
    NothingToPublish,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub stages_succeeded: usize,
    pub stages_total: usize,
    pub sources: Vec<SourceReport>,
    pub totals: MergeTotals,
    pub counts: OutcomeCounts,
    pub output: PathBuf,
    pub bytes: usize,
    pub saved_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishStatus>,
}

/// Per-run collaborators and settings.
pub struct PipelineContext {
    pub config: PipelineConfig,
    transport: Arc<dyn Transport>,
    stages: Vec<Box<dyn Stage>>,
    publisher: Option<Box<dyn Publisher>>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            stages: Vec::new(),
            publisher: None,
        }
    }

    /// Production wiring: reqwest transport, one [`CommandStage`] per configured
    /// stage and a [`GitPublisher`] when `publish` is set.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let transport =
            ReqwestTransport::new(config.fetch.timeout()).map_err(PipelineError::Transport)?;
        let stages: Vec<Box<dyn Stage>> = config
            .stages
            .iter()
            .map(|stage| Box::new(CommandStage::from(stage)) as Box<dyn Stage>)
            .collect();
        let publisher = config
            .publish
            .as_ref()
            .map(|publish| Box::new(GitPublisher::from(publish)) as Box<dyn Publisher>);
        Ok(Self {
            config,
            transport: Arc::new(transport),
            stages,
            publisher,
        })
    }

    pub fn with_stages(mut self, stages: Vec<Box<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_publisher(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn without_publisher(mut self) -> Self {
        self.publisher = None;
        self
    }
}

fn enter(state: &mut RunState, next: RunState) {
    info!(from = %state, to = %next, "[MERGE] {next}");
    *state = next;
}

/// Executes one full run. See the module docs for the state sequence.
pub async fn run(ctx: &PipelineContext) -> Result<RunReport, PipelineError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("merge_run", run_id = %run_id);
    run_inner(ctx, run_id).instrument(span).await
}

async fn run_inner(ctx: &PipelineContext, run_id: Uuid) -> Result<RunReport, PipelineError> {
    let config = &ctx.config;
    let mut state = RunState::Idle;
    info!(output = %config.output.display(), "[MERGE] Starting merge run");

    let _lock = match &config.lock_file {
        Some(path) => match RunLock::acquire(path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                error!(error = %e, "[MERGE] Cannot start run");
                return Err(e.into());
            }
        },
        None => None,
    };

    let stages_succeeded = if ctx.stages.is_empty() {
        0
    } else {
        run_stages(&ctx.stages).await
    };

    enter(&mut state, RunState::LoadingSources);
    let primary = load_sources(config);

    let fetcher = DocumentFetcher::new(Arc::clone(&ctx.transport), config.fetch.retry_policy())
        .with_console(config.console);
    let mut accumulator =
        MergeAccumulator::default().with_dedupe_channels(config.merge.dedupe_channels);
    let mut reports = Vec::new();

    enter(&mut state, RunState::FetchingSources(primary.len()));
    let outcomes = fetch_all(&fetcher, &primary, &config.fetch).await;
    enter(&mut state, RunState::Accumulating);
    accumulate(
        &mut accumulator,
        &mut reports,
        primary.iter().cloned().zip(outcomes),
        SourcePass::Primary,
    );

    enter(&mut state, RunState::ExtractingArchives);
    let archived: Vec<SourceRef> = match &config.archive_dir {
        Some(dir) => extract_archives(dir)
            .into_iter()
            .map(SourceRef::local)
            .collect(),
        None => Vec::new(),
    };
    if !archived.is_empty() {
        info!(count = archived.len(), "[MERGE] Merging extracted archives");
        let outcomes = fetch_all(&fetcher, &archived, &config.fetch).await;
        accumulate(
            &mut accumulator,
            &mut reports,
            archived.iter().cloned().zip(outcomes),
            SourcePass::Archive,
        );
    }

    if primary.is_empty() && archived.is_empty() {
        error!("[MERGE] No sources resolved; nothing to merge");
        return Err(PipelineError::NoSources);
    }

    if config.merge.channels_first {
        accumulator.reorder_channels_first();
    }

    let totals = accumulator.totals();
    let counts = accumulator.counts();
    info!(
        channels = totals.channels,
        programmes = totals.programmes,
        dropped = totals.dropped,
        succeeded = counts.succeeded,
        skipped = counts.skipped,
        failed = counts.failed,
        "[MERGE] Merged {} of {} sources",
        counts.succeeded,
        reports.len()
    );

    enter(&mut state, RunState::Persisting);
    let saved = match save(accumulator.document(), &config.output) {
        Ok(saved) => saved,
        Err(e) => {
            enter(&mut state, RunState::PersistFailed);
            return Err(e.into());
        }
    };

    let publish = match &ctx.publisher {
        Some(publisher) => {
            let status = publish_saved(publisher.as_ref(), &saved.path).await;
            enter(&mut state, RunState::Published);
            Some(status)
        }
        None => None,
    };

    enter(&mut state, RunState::Done);
    Ok(RunReport {
        run_id: run_id.to_string(),
        state,
        stages_succeeded,
        stages_total: ctx.stages.len(),
        sources: reports,
        totals,
        counts,
        output: saved.path,
        bytes: saved.bytes,
        saved_at: saved.saved_at,
        publish,
    })
}

/// Fetches every source, returning outcomes in source order whatever the
/// concurrency.
async fn fetch_all(
    fetcher: &DocumentFetcher,
    sources: &[SourceRef],
    fetch: &FetchConfig,
) -> Vec<FetchOutcome> {
    let total = sources.len();
    if fetch.concurrency <= 1 {
        let mut outcomes = Vec::with_capacity(total);
        for (index, source) in sources.iter().enumerate() {
            if index > 0 && !fetch.pause().is_zero() {
                tokio::time::sleep(fetch.pause()).await;
            }
            outcomes.push(fetcher.fetch(source, SourcePosition { index, total }).await);
        }
        return outcomes;
    }

    stream::iter(sources.iter().enumerate())
        .map(|(index, source)| fetcher.fetch(source, SourcePosition { index, total }))
        .buffered(fetch.concurrency)
        .collect()
        .await
}

fn accumulate(
    accumulator: &mut MergeAccumulator,
    reports: &mut Vec<SourceReport>,
    outcomes: impl Iterator<Item = (SourceRef, FetchOutcome)>,
    pass: SourcePass,
) {
    for (source, outcome) in outcomes {
        let kind = outcome.kind();
        let attempts = outcome.attempts();
        let detail = match &outcome {
            FetchOutcome::Success { .. } => None,
            FetchOutcome::Skipped { reason, .. } => Some(reason.clone()),
            FetchOutcome::Failed { error, .. } => Some(error.to_string()),
        };
        let merged = accumulator.record(outcome);
        reports.push(SourceReport {
            source,
            pass,
            outcome: kind,
            attempts,
            detail,
            merged,
        });
    }
}

async fn publish_saved(publisher: &dyn Publisher, path: &std::path::Path) -> PublishStatus {
    let label = Local::now().format(PUBLISH_LABEL_FORMAT).to_string();
    info!(path = %path.display(), label = %label, "[PUBLISH] Publishing saved guide");
    match publisher.publish(path, &label).await {
        Ok(PublishOutcome::Published) => {
            info!("[PUBLISH] Published");
            PublishStatus::Published
        }
        Ok(PublishOutcome::NothingToPublish) => {
            info!("[PUBLISH] No changes to publish");
            PublishStatus::NothingToPublish
        }
        Err(e) => {
            warn!(error = %e, "[PUBLISH] Publish failed, not retrying");
            PublishStatus::Failed {
                error: e.to_string(),
            }
        }
    }
}
