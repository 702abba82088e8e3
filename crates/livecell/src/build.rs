//! Ephemeral environment builds: build URLs, the progress event stream and
//! saved-session records for reusing a finished build.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{BinderOptions, RepoProvider, SavedSessionOptions, DEFAULT_BINDER_URL, DEFAULT_REF};
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// One event of the build progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl BuildEvent {
    pub fn phase(phase: &str) -> Self {
        Self {
            phase: Some(phase.to_string()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn ready(url: &str, token: &str) -> Self {
        Self {
            phase: Some("ready".to_string()),
            message: None,
            url: Some(url.to_string()),
            token: Some(token.to_string()),
        }
    }
}

fn strip_host_prefix<'a>(repo: &'a str, host: &str) -> &'a str {
    let without_scheme = repo
        .strip_prefix("https://")
        .or_else(|| repo.strip_prefix("http://"))
        .unwrap_or(repo);
    match without_scheme.strip_prefix(host) {
        Some(rest) if rest.starts_with('/') => rest,
        _ => repo,
    }
}

/// Build endpoint for `binder`: `{binderUrl}/build/{provider}/{repo}/{ref}`.
///
/// GitHub repositories keep their `owner/name` path; GitLab and plain git
/// repositories are percent-encoded into a single segment.
pub fn build_url(binder: &BinderOptions) -> Result<String> {
    let repo = binder
        .repo
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| Error::Config("binderOptions.repo is not set".to_string()))?;
    let git_ref = if binder.git_ref.is_empty() {
        DEFAULT_REF
    } else {
        binder.git_ref.as_str()
    };
    let binder_url = if binder.binder_url.is_empty() {
        DEFAULT_BINDER_URL
    } else {
        binder.binder_url.trim_end_matches('/')
    };

    let mut url = Url::parse(binder_url)
        .map_err(|e| Error::Config(format!("binderUrl {binder_url:?}: {e}")))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::Config(format!("binderUrl {binder_url:?} cannot be a base")))?;
        segments
            .pop_if_empty()
            .extend(["build", binder.repo_provider.as_path()]);
        match binder.repo_provider {
            RepoProvider::Github => {
                let repo = strip_host_prefix(repo, "github.com").trim_matches('/');
                segments.extend(repo.split('/'));
            }
            RepoProvider::Gitlab => {
                segments.push(strip_host_prefix(repo, "gitlab.com").trim_matches('/'));
            }
            RepoProvider::Git => {
                segments.push(repo.trim_matches('/'));
            }
        }
        segments.push(git_ref);
    }
    Ok(url.to_string())
}

/// Incremental parser for the server-sent progress stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Feed arbitrary bytes and drain every complete event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<BuildEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let mut events = Vec::new();

        while let Some(split) = self.buffer.find("\n\n") {
            let frame = self.buffer[..split].to_string();
            self.buffer.drain(0..split + 2);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            match serde_json::from_str::<BuildEvent>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!("[broker] Skipping malformed build event {:?}: {}", payload, e),
            }
        }

        events
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Consumer end of a build progress stream.
///
/// Closing (explicitly or by drop) cancels the producer, which must then
/// drop its connection.
#[derive(Debug)]
pub struct BuildStream {
    rx: mpsc::Receiver<Result<BuildEvent>>,
    closer: CancellationToken,
}

/// Producer end of a build progress stream.
#[derive(Debug, Clone)]
pub struct BuildStreamSender {
    tx: mpsc::Sender<Result<BuildEvent>>,
    closer: CancellationToken,
}

impl BuildStream {
    pub fn channel(capacity: usize) -> (BuildStreamSender, BuildStream) {
        let (tx, rx) = mpsc::channel(capacity);
        let closer = CancellationToken::new();
        (
            BuildStreamSender {
                tx,
                closer: closer.clone(),
            },
            BuildStream { rx, closer },
        )
    }

    /// Next event, or `None` once the producer has hung up.
    pub async fn next(&mut self) -> Option<Result<BuildEvent>> {
        if self.closer.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if !self.closer.is_cancelled() {
            debug!("[broker] Closing build stream");
            self.closer.cancel();
        }
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

impl Drop for BuildStream {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

impl BuildStreamSender {
    /// Returns false once the consumer has closed the stream.
    pub async fn send(&self, event: Result<BuildEvent>) -> bool {
        if self.closer.is_cancelled() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Resolves when the consumer closes the stream.
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// A finished build remembered for reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSessionRecord {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub last_used: DateTime<Utc>,
}

impl SavedSessionRecord {
    pub fn is_expired(&self, max_age_secs: u64, now: DateTime<Utc>) -> bool {
        // Duration::seconds panics past i64::MAX milliseconds
        let secs = i64::try_from(max_age_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        let max_age = Duration::seconds(secs);
        now.signed_duration_since(self.last_used) > max_age
    }
}

/// The saved-session slot for one build URL.
pub struct SavedSessions {
    store: Arc<dyn KeyValueStore>,
    key: String,
    options: SavedSessionOptions,
}

impl SavedSessions {
    pub fn new(store: Arc<dyn KeyValueStore>, build_url: &str, options: SavedSessionOptions) -> Self {
        Self {
            key: format!("{}{}", options.storage_prefix, build_url),
            store,
            options,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// The stored record, if one exists and is still fresh.
    ///
    /// Expired and unparseable records are evicted.
    pub fn lookup(&self, now: DateTime<Utc>) -> Result<Option<SavedSessionRecord>> {
        if !self.options.enabled {
            return Ok(None);
        }
        let Some(raw) = self.store.get(&self.key)? else {
            debug!("[broker] No session saved in {}", self.key);
            return Ok(None);
        };
        let record: SavedSessionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                self.evict();
                return Err(Error::Store(format!("saved session {}: {e}", self.key)));
            }
        };
        if record.is_expired(self.options.max_age, now) {
            debug!(
                "[broker] Not using expired saved session for {} from {}",
                record.url, record.last_used
            );
            self.evict();
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn save(&self, record: &SavedSessionRecord) -> Result<()> {
        if !self.options.enabled {
            return Ok(());
        }
        let json = serde_json::to_string(record).map_err(|e| Error::Store(e.to_string()))?;
        self.store.set(&self.key, &json)
    }

    /// Refresh the last-used timestamp of `record` and store it.
    pub fn touch(&self, record: &mut SavedSessionRecord, now: DateTime<Utc>) -> Result<()> {
        record.last_used = now;
        self.save(record)
    }

    pub fn evict(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            warn!("[store] Failed to evict saved session {}: {}", self.key, e);
        }
    }
}

/// Every saved session in `store` under `prefix`, keyed by build URL.
pub fn list_saved_sessions(
    store: &dyn KeyValueStore,
    prefix: &str,
) -> Result<Vec<(String, Option<SavedSessionRecord>)>> {
    let mut sessions = Vec::new();
    for key in store.keys()? {
        let Some(build_url) = key.strip_prefix(prefix) else {
            continue;
        };
        let record = store
            .get(&key)?
            .and_then(|raw| serde_json::from_str(&raw).ok());
        sessions.push((build_url.to_string(), record));
    }
    Ok(sessions)
}
