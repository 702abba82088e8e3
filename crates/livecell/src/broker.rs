//! Obtaining a live kernel: directly from a server, or from an ephemeral
//! build, reusing a previously built server while it is still alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};

use crate::backend::Backend;
use crate::build::{build_url, SavedSessionRecord, SavedSessions};
use crate::config::{KernelOptions, Options};
use crate::error::{Error, Result};
use crate::events::{EventBus, KernelStatus};
use crate::server::ServerSettings;
use crate::session::KernelSession;
use crate::store::KeyValueStore;

type Acquisition = Shared<BoxFuture<'static, Result<KernelSession>>>;

/// Hands out kernel sessions, one acquisition at a time.
///
/// A call made while another acquisition is still running waits for that
/// one instead of starting a second connect or build.
pub struct SessionBroker {
    backend: Arc<dyn Backend>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    in_flight: Mutex<Option<(u64, Acquisition)>>,
    next_attempt: AtomicU64,
}

impl SessionBroker {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        Self {
            backend,
            store,
            events,
            in_flight: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub async fn acquire_session(&self, options: &Options) -> Result<KernelSession> {
        let (attempt, acquisition) = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some((attempt, acquisition)) => {
                    debug!("[broker] Joining in-flight acquisition #{}", attempt);
                    (*attempt, acquisition.clone())
                }
                None => {
                    let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
                    let acquirer = Acquirer {
                        backend: self.backend.clone(),
                        store: self.store.clone(),
                        events: self.events.clone(),
                        options: options.clone(),
                    };
                    let acquisition = acquirer.run().boxed().shared();
                    *slot = Some((attempt, acquisition.clone()));
                    (attempt, acquisition)
                }
            }
        };

        let result = acquisition.await;

        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(slot.as_ref(), Some((current, _)) if *current == attempt) {
            *slot = None;
        }
        result
    }
}

struct Acquirer {
    backend: Arc<dyn Backend>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    options: Options,
}

impl Acquirer {
    async fn run(self) -> Result<KernelSession> {
        if !self.options.use_ephemeral_build() {
            let server = match ServerSettings::from_options(&self.options.kernel_options.server_settings) {
                Ok(server) => server,
                Err(e) => {
                    self.events
                        .status(KernelStatus::Failed, format!("Failed to connect to kernel: {e}"));
                    return Err(e);
                }
            };
            return self.start_kernel(&server).await;
        }

        let binder = &self.options.binder_options;
        let url = match build_url(binder) {
            Ok(url) => url,
            Err(e) => {
                self.events
                    .status(KernelStatus::Failed, format!("Failed to request build: {e}"));
                return Err(e);
            }
        };
        info!("[broker] Build URL {}", url);
        let saved = SavedSessions::new(self.store.clone(), &url, binder.saved_session.clone());

        if let Some(server) = self.reusable_server(&saved).await {
            match self.launch(&server).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(
                        "[broker] Saved server {} did not start a kernel, requesting a new build: {}",
                        server.base_url, e
                    );
                    saved.evict();
                }
            }
        }

        let server = self.build_server(&url, &saved).await?;
        self.start_kernel(&server).await
    }

    /// A saved server that is fresh and answers a liveness probe.
    ///
    /// Never fails: anything that goes wrong means "build a new one".
    async fn reusable_server(&self, saved: &SavedSessions) -> Option<ServerSettings> {
        let mut record = match saved.lookup(Utc::now()) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                error!("[broker] Failed to load existing server connection: {}", e);
                return None;
            }
        };
        debug!("[broker] Saved session detected for {}", record.url);

        let server = self.server_for(&record.url, record.token.as_deref());
        if let Err(e) = self.backend.list_running(&server).await {
            info!(
                "[broker] Saved connection to {} appears to be invalid, requesting new session: {}",
                record.url, e
            );
            saved.evict();
            return None;
        }

        if let Err(e) = saved.touch(&mut record, Utc::now()) {
            warn!("[store] Could not refresh saved session {}: {}", saved.key(), e);
        }
        let message = format!(
            "Saved binder session is valid, reusing connection to {}",
            record.url
        );
        info!("[broker] {}", message);
        self.events.status(KernelStatus::Reusing, message.clone());
        self.events.kernel_message(message);
        Some(server)
    }

    async fn build_server(&self, url: &str, saved: &SavedSessions) -> Result<ServerSettings> {
        self.events
            .status(KernelStatus::Building, "Requesting build from binder");

        let mut stream = match self.backend.open_build_stream(url).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("[broker] Lost connection to {}: {}", url, e);
                self.events
                    .status(KernelStatus::Failed, "Lost connection to Binder");
                return Err(Error::Build(e.to_string()));
            }
        };

        let mut phase: Option<String> = None;
        let outcome = loop {
            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => break Err(Error::Build(e.to_string())),
                None => break Err(Error::Build("build stream ended before the server was ready".into())),
            };

            if let Some(new_phase) = event.phase.as_deref().map(str::to_ascii_lowercase) {
                if phase.as_deref() != Some(new_phase.as_str()) {
                    debug!("[broker] Binder phase: {}", new_phase);
                    self.events.status(
                        KernelStatus::from_phase(&new_phase),
                        format!("Binder is {new_phase}"),
                    );
                    phase = Some(new_phase);
                }
            }
            if let Some(message) = event.message.as_deref() {
                debug!("[broker] Binder: {}", message.trim_end());
                self.events.kernel_message(format!("Binder: {message}"));
            }

            match phase.as_deref() {
                Some("failed") => {
                    let reason = event.message.unwrap_or_else(|| "build failed".to_string());
                    error!("[broker] Failed to build {}: {}", url, reason.trim_end());
                    break Err(Error::Build(reason));
                }
                Some("ready") => {
                    let Some(server_url) = event.url else {
                        break Err(Error::Build("ready event without a server url".into()));
                    };
                    let record = SavedSessionRecord {
                        url: server_url,
                        token: event.token,
                        last_used: Utc::now(),
                    };
                    if let Err(e) = saved.save(&record) {
                        warn!("[store] Couldn't save binder connection info: {}", e);
                    }
                    break Ok(self.server_for(&record.url, record.token.as_deref()));
                }
                _ => {}
            }
        };
        stream.close();

        if let Err(e) = &outcome {
            if phase.as_deref() != Some("failed") {
                error!("[broker] Lost connection to {}: {}", url, e);
                self.events
                    .status(KernelStatus::Failed, "Lost connection to Binder");
            }
        }
        outcome
    }

    fn server_for(&self, url: &str, token: Option<&str>) -> ServerSettings {
        let mut server = ServerSettings::from_url_and_token(url, token);
        server.append_token = self
            .options
            .kernel_options
            .server_settings
            .append_token;
        server
    }

    /// Start a kernel and report failure on the status channel.
    async fn start_kernel(&self, server: &ServerSettings) -> Result<KernelSession> {
        let result = self.launch(server).await;
        if let Err(e) = &result {
            error!("[broker] Failed to start kernel on {}: {}", server.base_url, e);
            self.events
                .status(KernelStatus::Failed, format!("Failed to start kernel: {e}"));
        }
        result
    }

    /// Start a kernel without reporting failure, for attempts that have a
    /// fallback.
    async fn launch(&self, server: &ServerSettings) -> Result<KernelSession> {
        let kernel: &KernelOptions = &self.options.kernel_options;
        self.events.status(KernelStatus::Starting, "Starting Kernel");
        match self.backend.start_session(server, kernel).await {
            Ok(session) => {
                info!(
                    "[broker] Kernel {} is ready on {}",
                    session.kernel_id(),
                    server.base_url
                );
                self.events.status(KernelStatus::Ready, "Kernel is ready");
                Ok(session)
            }
            Err(Error::Connection(message)) => Err(Error::Connection(message)),
            Err(other) => Err(Error::Connection(other.to_string())),
        }
    }
}
