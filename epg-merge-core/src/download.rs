//! Document fetcher: one [`SourceRef`] in, one [`FetchOutcome`] out.
//!
//! Remote sources go through a [`Transport`] with the shared retry helper; only
//! transport failures and non-2xx statuses are retried. Local sources are read
//! once. Either way the bytes are gunzipped when they carry a gzip payload and
//! then parsed into a [`Document`]. `fetch` never returns an error: every failure
//! is folded into the outcome so the caller can move on to the next source.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use tracing::{debug, error, info, warn};

use crate::contract::{FetchOutcome, HttpPayload, Transport, TransportError};
use crate::document::{Document, DocumentError};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::source::SourceRef;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug)]
pub enum FetchError {
    Transport(TransportError),
    Status(u16),
    MissingLocal(PathBuf),
    Io(std::io::Error),
    Decompress(std::io::Error),
    Parse(DocumentError),
}

impl FetchError {
    /// Only network conditions are worth another attempt; the bytes of a parse
    /// failure or a missing file will not change between attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Status(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(e) => write!(f, "{e}"),
            FetchError::Status(code) => write!(f, "HTTP {code}"),
            FetchError::MissingLocal(path) => write!(f, "local file not found: {}", path.display()),
            FetchError::Io(e) => write!(f, "read failed: {e}"),
            FetchError::Decompress(e) => write!(f, "gzip decompression failed: {e}"),
            FetchError::Parse(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        FetchError::Transport(e)
    }
}

impl From<DocumentError> for FetchError {
    fn from(e: DocumentError) -> Self {
        FetchError::Parse(e)
    }
}

/// Production [`Transport`] backed by a shared `reqwest::Client` with a
/// per-request timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpPayload, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?.to_vec();
        Ok(HttpPayload {
            status,
            content_type,
            body,
        })
    }
}

/// Gunzips `bytes` when they start with the gzip magic number. A payload that
/// was `signalled` as gzip but is plain (e.g. already decoded in transit) is
/// returned unchanged.
pub fn decompress_if_gzip(bytes: Vec<u8>, signalled: bool) -> Result<Vec<u8>, FetchError> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        if signalled {
            debug!("Payload signalled as gzip but is not compressed, using as-is");
        }
        return Ok(bytes);
    }
    let mut decoder = MultiGzDecoder::new(bytes.as_slice());
    let mut out = Vec::with_capacity(bytes.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(FetchError::Decompress)?;
    debug!(
        compressed = bytes.len(),
        decompressed = out.len(),
        "Decompressed gzip payload"
    );
    Ok(out)
}

fn content_type_is_gzip(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

/// Where a source sits in the run, for log lines.
#[derive(Debug, Clone, Copy)]
pub struct SourcePosition {
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index + 1, self.total)
    }
}

pub struct DocumentFetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    console: bool,
}

impl DocumentFetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            console: false,
        }
    }

    /// Mirror per-attempt log lines to stdout.
    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, source: &SourceRef, position: SourcePosition) -> FetchOutcome {
        info!(
            source_index = position.index + 1,
            total = position.total,
            source = %source,
            "[FETCH] Fetching {position} - {source}"
        );
        self.console_line(format_args!("Fetching {position} - {source}"));

        let (bytes, attempts) = match source {
            SourceRef::Remote { url } => match self.fetch_remote(url, position).await {
                (Ok(payload), attempts) => {
                    let signalled = source.has_gzip_suffix()
                        || content_type_is_gzip(payload.content_type.as_deref());
                    (decompress_if_gzip(payload.body, signalled), attempts)
                }
                (Err(e), attempts) => (Err(e), attempts),
            },
            SourceRef::Local { path } => {
                let read = match tokio::fs::read(path).await {
                    Ok(bytes) => decompress_if_gzip(bytes, source.has_gzip_suffix()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(FetchError::MissingLocal(path.clone()))
                    }
                    Err(e) => Err(FetchError::Io(e)),
                };
                (read, 1)
            }
        };

        let outcome = match bytes.and_then(|b| Document::parse(&b).map_err(FetchError::from)) {
            Ok(document) if document.root.child_elements().next().is_none() => {
                FetchOutcome::Skipped {
                    reason: "document has no elements".to_string(),
                    attempts,
                }
            }
            Ok(document) => FetchOutcome::Success { document, attempts },
            Err(error) => FetchOutcome::Failed { error, attempts },
        };
        self.log_outcome(source, position, &outcome);
        outcome
    }

    async fn fetch_remote(
        &self,
        url: &str,
        position: SourcePosition,
    ) -> (Result<HttpPayload, FetchError>, u32) {
        let budget = self.policy.attempts.max(1);
        let retried = retry_with_backoff(&self.policy, FetchError::is_retryable, |attempt| {
            let transport = Arc::clone(&self.transport);
            async move {
                let result = match transport.get(url).await {
                    Ok(payload) if payload.is_success() => Ok(payload),
                    Ok(payload) => Err(FetchError::Status(payload.status)),
                    Err(e) => Err(FetchError::Transport(e)),
                };
                match &result {
                    Ok(payload) => debug!(
                        source_index = position.index + 1,
                        attempt,
                        status = payload.status,
                        bytes = payload.body.len(),
                        "[FETCH] Attempt succeeded"
                    ),
                    Err(e) => {
                        error!(
                            source_index = position.index + 1,
                            total = position.total,
                            attempt,
                            budget,
                            url,
                            error = %e,
                            "[FETCH] Attempt {attempt}/{budget} failed for {url}: {e}"
                        );
                        self.console_line(format_args!(
                            "Attempt {attempt}/{budget} failed for {url}: {e}"
                        ));
                    }
                }
                result
            }
        })
        .await;
        (retried.result, retried.attempts)
    }

    fn log_outcome(&self, source: &SourceRef, position: SourcePosition, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Success { document, attempts } => {
                let elements = document.root.child_elements().count();
                info!(
                    source_index = position.index + 1,
                    total = position.total,
                    attempts,
                    elements,
                    "[FETCH] Successfully fetched {position}"
                );
                self.console_line(format_args!("Successfully fetched {position}"));
            }
            FetchOutcome::Skipped { reason, attempts } => {
                warn!(
                    source_index = position.index + 1,
                    total = position.total,
                    attempts,
                    source = %source,
                    reason = %reason,
                    "[FETCH] Skipped {position}"
                );
                self.console_line(format_args!("Skipped {position} - {source}: {reason}"));
            }
            FetchOutcome::Failed { error, attempts } => {
                error!(
                    source_index = position.index + 1,
                    total = position.total,
                    attempts,
                    source = %source,
                    error = %error,
                    "[FETCH] Giving up on {position} - {source}"
                );
                self.console_line(format_args!(
                    "Failed {position} - {source} after {attempts} attempt(s): {error}"
                ));
            }
        }
    }

    fn console_line(&self, line: fmt::Arguments<'_>) {
        if self.console {
            println!("{line}");
        }
    }
}
