#![allow(unused)]

//! # contract: the seams of the merge pipeline
//!
//! This module defines the traits through which the pipeline talks to the outside
//! world, and the plain data types that cross those seams:
//!
//! - [`Transport`]: issues HTTP GETs for remote sources. The production
//!   implementation is [`crate::download::ReqwestTransport`].
//! - [`Stage`]: a pre-fetch collaborator ("refresh local sources"), run in order
//!   before any source is fetched. See [`crate::preprocess::CommandStage`].
//! - [`Publisher`]: hands the saved document off to a versioning/distribution
//!   mechanism. See [`crate::publish::GitPublisher`].
//!
//! ## Mocking & Testing
//! - Each trait is annotated for `mockall`, and the generated mocks are exported
//!   behind the `test-export-mocks` feature so integration tests (and downstream
//!   crates) can drive the pipeline without network or subprocesses.
//!
//! ## Error Handling
//! - Implementations never panic on transport/process failures: every failure is
//!   returned as the trait's error type so the pipeline can log it and continue.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;

use mockall::{automock, predicate::*};

use crate::document::Document;
use crate::download::FetchError;

/// Raw HTTP response as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct HttpPayload {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpPayload {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failure. Every variant is transient from the fetcher's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "request timed out: {msg}"),
            TransportError::Connect(msg) => write!(f, "connection failed: {msg}"),
            TransportError::Other(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Issues a bounded-time HTTP GET.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`. A non-2xx status is NOT an error here; the caller inspects
    /// [`HttpPayload::status`].
    async fn get(&self, url: &str) -> Result<HttpPayload, TransportError>;
}

#[derive(Debug)]
pub enum StageError {
    Launch { stage: String, source: std::io::Error },
    Exit { stage: String, code: Option<i32> },
    Other(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Launch { stage, source } => {
                write!(f, "stage '{stage}' could not be launched: {source}")
            }
            StageError::Exit { stage, code } => match code {
                Some(code) => write!(f, "stage '{stage}' exited with code {code}"),
                None => write!(f, "stage '{stage}' was terminated by a signal"),
            },
            StageError::Other(msg) => write!(f, "stage failed: {msg}"),
        }
    }
}

impl std::error::Error for StageError {}

/// A collaborator run before the fetch phase, e.g. a generator that refreshes
/// local guide files.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> String;

    async fn run(&self) -> Result<(), StageError>;
}

/// What a publisher did with the saved document.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    NothingToPublish,
}

#[derive(Debug)]
pub enum PublishError {
    Launch(std::io::Error),
    Command { command: String, stderr: String },
    Other(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Launch(e) => write!(f, "failed to launch publisher: {e}"),
            PublishError::Command { command, stderr } => {
                write!(f, "`{command}` failed: {}", stderr.trim())
            }
            PublishError::Other(msg) => write!(f, "publish failed: {msg}"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Hands a saved document off for versioning or distribution.
///
/// Called at most once per run, after a successful save. The pipeline logs the
/// result and never retries.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, path: &Path, label: &str) -> Result<PublishOutcome, PublishError>;
}

/// Result of fetching one source reference.
#[derive(Debug)]
pub enum FetchOutcome {
    Success { document: Document, attempts: u32 },
    Skipped { reason: String, attempts: u32 },
    Failed { error: FetchError, attempts: u32 },
}

impl FetchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Success { .. } => "success",
            FetchOutcome::Skipped { .. } => "skipped",
            FetchOutcome::Failed { .. } => "failed",
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FetchOutcome::Success { attempts, .. }
            | FetchOutcome::Skipped { attempts, .. }
            | FetchOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}
