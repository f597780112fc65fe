//! Bundle content retrieval
//!
//! The unpacker hands the controller a three-state answer: content retrieval
//! is in flight (Pending), finished (Unpacked, with the bundle's manifests),
//! or failed. The controller polls Pending on a bounded interval instead of
//! blocking a worker on the download.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use trellis_catalog::Bundle;
use trellis_common::crd::Extension;
use trellis_common::{Error, Result};

/// Outcome of one unpack attempt
#[derive(Debug, Clone, PartialEq)]
pub enum UnpackResult {
    /// Content retrieval is still in progress; poll again shortly
    Pending,
    /// Content is available; manifests are the bundle's objects as YAML/JSON
    /// documents
    Unpacked {
        /// The bundle's manifest documents, one per file, in file order
        manifests: Vec<String>,
    },
    /// Content retrieval failed; retry with backoff
    Failed {
        /// What went wrong
        message: String,
    },
}

/// Retrieves a bundle's content and reports readiness.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Unpacker: Send + Sync {
    /// Fetch (or observe previously fetched) content for the bundle.
    async fn unpack(&self, ext: &Extension, bundle: &Bundle) -> Result<UnpackResult>;
}

enum JobState {
    InFlight,
    Done(std::result::Result<(), String>),
}

/// Unpacker backed by a content cache directory and archive downloads.
///
/// Content already present in the cache is served immediately. Otherwise an
/// http(s) content reference starts a background download+untar into the
/// cache; the first call returns Pending and later calls observe completion.
/// A finished failure is reported once and then cleared so the next attempt
/// retries the download.
pub struct ArchiveUnpacker {
    cache_dir: PathBuf,
    http: reqwest::Client,
    jobs: Arc<DashMap<String, JobState>>,
}

impl ArchiveUnpacker {
    /// Per-download timeout
    const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

    /// Create an unpacker rooted at the given cache directory
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            http: reqwest::Client::new(),
            jobs: Arc::new(DashMap::new()),
        }
    }

    fn content_dir(&self, bundle: &Bundle) -> PathBuf {
        self.cache_dir.join(sanitize_name(&bundle.name))
    }

    fn spawn_fetch(&self, bundle: &Bundle, content_dir: PathBuf) {
        let key = bundle.name.clone();
        let url = bundle.image.clone();
        let http = self.http.clone();
        let jobs = self.jobs.clone();

        jobs.insert(key.clone(), JobState::InFlight);
        tokio::spawn(async move {
            let outcome = fetch_and_unpack(&http, &url, &content_dir).await;
            if let Err(message) = &outcome {
                warn!(bundle = %key, error = %message, "bundle content fetch failed");
            } else {
                info!(bundle = %key, "bundle content unpacked");
            }
            jobs.insert(key, JobState::Done(outcome));
        });
    }
}

#[async_trait]
impl Unpacker for ArchiveUnpacker {
    async fn unpack(&self, _ext: &Extension, bundle: &Bundle) -> Result<UnpackResult> {
        let content_dir = self.content_dir(bundle);

        if tokio::fs::try_exists(&content_dir).await.unwrap_or(false) {
            self.jobs.remove(&bundle.name);
            let manifests = read_manifests(&content_dir).await?;
            return Ok(UnpackResult::Unpacked { manifests });
        }

        // remove() both reads and clears a finished failure so the next
        // reconcile pass restarts the download
        if let Some((_, state)) = self.jobs.remove(&bundle.name) {
            match state {
                JobState::InFlight => {
                    self.jobs.insert(bundle.name.clone(), JobState::InFlight);
                    return Ok(UnpackResult::Pending);
                }
                JobState::Done(Err(message)) => {
                    return Ok(UnpackResult::Failed { message });
                }
                // Done(Ok) with no content dir means the cache was cleared
                // underneath us; fall through and fetch again
                JobState::Done(Ok(())) => {}
            }
        }

        if !bundle.image.starts_with("http://") && !bundle.image.starts_with("https://") {
            return Ok(UnpackResult::Failed {
                message: format!(
                    "unsupported content reference {:?}: expected an http(s) archive locator \
                     or pre-populated cache content",
                    bundle.image
                ),
            });
        }

        debug!(bundle = %bundle.name, url = %bundle.image, "starting bundle content fetch");
        self.spawn_fetch(bundle, content_dir);
        Ok(UnpackResult::Pending)
    }
}

async fn fetch_and_unpack(
    http: &reqwest::Client,
    url: &str,
    content_dir: &Path,
) -> std::result::Result<(), String> {
    let response = http
        .get(url)
        .timeout(ArchiveUnpacker::FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| format!("fetch failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("content endpoint returned {}", response.status()));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("content read failed: {e}"))?;

    // Unpack into a staging dir first so a partially written archive can
    // never be mistaken for complete content
    let staging = content_dir.with_extension("partial");
    let staging_clone = staging.clone();
    let unpacked = tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&staging_clone)
            .map_err(|e| format!("create staging dir: {e}"))?;
        let mut archive = tar::Archive::new(bytes.as_ref());
        archive
            .unpack(&staging_clone)
            .map_err(|e| format!("unpack archive: {e}"))
    })
    .await
    .map_err(|e| format!("unpack task panicked: {e}"))?;
    unpacked?;

    tokio::fs::rename(&staging, content_dir)
        .await
        .map_err(|e| format!("finalize content dir: {e}"))?;
    Ok(())
}

async fn read_manifests(content_dir: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let mut stack = vec![content_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            Error::internal_with_context("unpacker", format!("read content dir: {e}"))
        })?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            Error::internal_with_context("unpacker", format!("read content dir: {e}"))
        })? {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            ) {
                paths.push(path);
            }
        }
    }
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::internal_with_context("unpacker", format!("read manifest {path:?}: {e}"))
        })?;
        manifests.push(content);
    }
    Ok(manifests)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
