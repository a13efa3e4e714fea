//! Discovery session manager.
//!
//! Owns one [`NetworkScanner`] per session id, forwards its progress as
//! [`DiscoveryEvent`]s and, when ONVIF is requested, runs an
//! [`OnvifScanner`] window alongside the network scan.

use crate::error::{DiscoveryError, Result};
use crate::netdetect;
use crate::onvif::OnvifScanner;
use crate::ports::{Connector, TcpConnector};
use crate::scanner::{validate_options, NetworkScanner};
use crate::types::{
    CameraProtocol, DiscoveryOptions, DiscoveryOverrides, DiscoveryProgress, DiscoveryResult,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use ::time::{format_description::well_known, OffsetDateTime};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Notification published on the session event stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    Progress {
        #[serde(rename = "sessionId")]
        session_id: String,
        progress: DiscoveryProgress,
    },
    Completed {
        #[serde(rename = "sessionId")]
        session_id: String,
        result: DiscoveryResult,
    },
    Error {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    Stopped {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl DiscoveryEvent {
    pub fn session_id(&self) -> &str {
        match self {
            DiscoveryEvent::Progress { session_id, .. }
            | DiscoveryEvent::Completed { session_id, .. }
            | DiscoveryEvent::Error { session_id, .. }
            | DiscoveryEvent::Stopped { session_id } => session_id,
        }
    }
}

/// Public description of a live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub started_at: String,
    pub options: DiscoveryOptions,
}

struct Session {
    scanner: Arc<NetworkScanner>,
    started_at: OffsetDateTime,
    options: DiscoveryOptions,
}

struct Inner {
    sessions: RwLock<HashMap<String, Session>>,
    events: broadcast::Sender<DiscoveryEvent>,
    connector: Arc<dyn Connector>,
    onvif: OnvifScanner,
}

/// Cheaply cloneable handle to the shared session table.
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryService {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(TcpConnector), OnvifScanner::new())
    }

    /// Build a service whose scanners use `connector` and whose ONVIF path uses `onvif`.
    pub fn with_parts(connector: Arc<dyn Connector>, onvif: OnvifScanner) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                events,
                connector,
                onvif,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    fn emit(events: &broadcast::Sender<DiscoveryEvent>, event: DiscoveryEvent) {
        // No subscribers is fine.
        let _ = events.send(event);
    }

    /// Register `session_id` and build its scanner. No scan I/O happens here.
    async fn register(
        &self,
        session_id: &str,
        overrides: DiscoveryOverrides,
    ) -> Result<Arc<NetworkScanner>> {
        let options = overrides.merge_over(DiscoveryOptions::default());
        validate_options(&options)?;
        // Auto-detection failures surface here, before any socket is opened.
        netdetect::resolve_network_range(options.network_range.as_deref())?;

        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(DiscoveryError::Concurrency(format!(
                "discovery session {session_id} already exists"
            )));
        }

        let events = self.inner.events.clone();
        let id = session_id.to_string();
        let scanner = Arc::new(
            NetworkScanner::new(options.clone())
                .with_connector(Arc::clone(&self.inner.connector))
                .with_progress_sink(Arc::new(move |progress: &DiscoveryProgress| {
                    Self::emit(
                        &events,
                        DiscoveryEvent::Progress {
                            session_id: id.clone(),
                            progress: progress.clone(),
                        },
                    );
                })),
        );

        sessions.insert(
            session_id.to_string(),
            Session {
                scanner: Arc::clone(&scanner),
                started_at: OffsetDateTime::now_utc(),
                options,
            },
        );
        info!(session = session_id, "discovery session registered");
        Ok(scanner)
    }

    async fn drive(&self, session_id: &str, scanner: Arc<NetworkScanner>) -> Result<()> {
        let onvif = scanner.options().wants(CameraProtocol::Onvif).then(|| {
            let probe = self.inner.onvif.clone();
            let cancel = scanner.cancellation_token();
            async move { probe.discover_with_cancel(cancel).await }
        });

        // A failed scan closes the ONVIF window instead of waiting it out.
        let scan = async {
            let outcome = scanner.start().await;
            if outcome.is_err() {
                scanner.cancellation_token().cancel();
            }
            outcome
        };

        let (outcome, onvif_cameras) = match onvif {
            Some(onvif) => tokio::join!(scan, onvif),
            None => (scan.await, Ok(Vec::new())),
        };

        match onvif_cameras {
            Ok(cameras) if !cameras.is_empty() => scanner.merge_cameras(cameras),
            Ok(_) => {}
            Err(e) => warn!(session = session_id, error = %e, "ONVIF discovery failed"),
        }

        match outcome {
            Ok(()) => {
                info!(session = session_id, "discovery session completed");
                Self::emit(
                    &self.inner.events,
                    DiscoveryEvent::Completed {
                        session_id: session_id.to_string(),
                        result: scanner.results(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                Self::emit(
                    &self.inner.events,
                    DiscoveryEvent::Error {
                        session_id: session_id.to_string(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Start a session and drive it to completion. Errors from the scan are re-raised.
    pub async fn start(&self, session_id: &str, overrides: DiscoveryOverrides) -> Result<()> {
        let scanner = self.register(session_id, overrides).await?;
        self.drive(session_id, scanner).await
    }

    /// Register a session now and drive it on a background task.
    pub async fn spawn(
        &self,
        session_id: &str,
        overrides: DiscoveryOverrides,
    ) -> Result<JoinHandle<Result<()>>> {
        let scanner = self.register(session_id, overrides).await?;
        let this = self.clone();
        let id = session_id.to_string();
        Ok(tokio::spawn(async move { this.drive(&id, scanner).await }))
    }

    /// Cancel and remove a session.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| DiscoveryError::SessionNotFound(session_id.to_string()))?;
        session.scanner.stop();
        info!(session = session_id, "discovery session stopped");
        Self::emit(
            &self.inner.events,
            DiscoveryEvent::Stopped {
                session_id: session_id.to_string(),
            },
        );
        Ok(())
    }

    pub async fn progress(&self, session_id: &str) -> Result<DiscoveryProgress> {
        self.with_session(session_id, |s| s.scanner.progress()).await
    }

    pub async fn results(&self, session_id: &str) -> Result<DiscoveryResult> {
        self.with_session(session_id, |s| s.scanner.results()).await
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.read().await;
        let mut out: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: id.clone(),
                started_at: s
                    .started_at
                    .format(&well_known::Rfc3339)
                    .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z")),
                options: s.options.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        out
    }

    async fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&Session) -> T) -> Result<T> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(session_id)
            .map(f)
            .ok_or_else(|| DiscoveryError::SessionNotFound(session_id.to_string()))
    }

    /// Best-effort stop of every session. Failures are logged, never raised.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(session = %id, error = %e, "failed to stop discovery session");
            }
        }
    }
}
