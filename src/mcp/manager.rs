//! Connection manager: owns every upstream session and drives lifecycle
//!
//! Startup connects all enabled upstreams in parallel (capped by the
//! configured fan-out limit) with linear retry on transient failures. A
//! periodic health pass probes connected sessions, attempts one reconnect
//! round for dead ones, and then signals listeners so the capability
//! registry can rebuild. A failed upstream never fails the gateway.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinSet;

use crate::config::ServerConfig;

use super::session::{SessionStatus, UpstreamSession};

pub struct ConnectionManager {
    /// Sessions in config order; order is what makes registry conflict
    /// resolution deterministic.
    sessions: RwLock<Vec<Arc<UpstreamSession>>>,

    /// Fan-out cap shared by connect and probe tasks.
    limit: Arc<Semaphore>,

    /// Bumped after every health pass.
    health_events: watch::Sender<u64>,
}

impl ConnectionManager {
    pub fn new(max_concurrent_connections: usize) -> Self {
        let (health_events, _) = watch::channel(0);
        ConnectionManager {
            sessions: RwLock::new(Vec::new()),
            limit: Arc::new(Semaphore::new(max_concurrent_connections.max(1))),
            health_events,
        }
    }

    /// Receiver that observes health-pass completions.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.health_events.subscribe()
    }

    /// Create sessions for every enabled spec and connect them in
    /// parallel. Individual failures are logged and the session parks in
    /// `Error`; the gateway continues, possibly with zero upstreams.
    pub async fn initialize(&self, specs: &[ServerConfig]) {
        let mut created = Vec::new();

        for spec in specs {
            if !spec.enabled {
                tracing::info!(upstream = %spec.id, "Upstream disabled, skipping");
                continue;
            }

            // Validate before constructing anything.
            let errors = spec.transport.validate();
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!(upstream = %spec.id, %error, "Invalid upstream config");
                }
                continue;
            }

            match UpstreamSession::new(Arc::new(spec.clone())) {
                Ok(session) => created.push(Arc::new(session)),
                Err(error) => {
                    tracing::error!(upstream = %spec.id, %error, "Failed to build upstream client");
                }
            }
        }

        {
            let mut sessions = self.sessions.write().await;
            sessions.extend(created.iter().cloned());
        }

        let mut tasks = JoinSet::new();
        for session in created {
            let limit = Arc::clone(&self.limit);
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                connect_with_retries(&session).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// One health pass: probe connected sessions, reconnect dead ones,
    /// then notify listeners.
    pub async fn health_check(&self) {
        let sessions = self.snapshot().await;

        let mut tasks = JoinSet::new();
        for session in sessions {
            let limit = Arc::clone(&self.limit);
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                match session.status() {
                    SessionStatus::Connected => {
                        if let Err(error) = session.probe().await {
                            tracing::warn!(
                                upstream = %session.id(),
                                %error,
                                "Health probe failed"
                            );
                        }
                    }
                    SessionStatus::Disconnected | SessionStatus::Error => {
                        session.mark_health_checked();
                        connect_with_retries(&session).await;
                    }
                    SessionStatus::Connecting => {}
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        self.health_events.send_modify(|n| *n += 1);
    }

    /// Run health passes forever at the given period.
    pub async fn run_health_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; initialization already
        // connected everything, so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::debug!("Health check pass");
            self.health_check().await;
        }
    }

    /// Best-effort close of every session, in parallel. Afterwards the
    /// manager holds no session references.
    pub async fn close_all(&self) {
        let sessions = {
            let mut slot = self.sessions.write().await;
            std::mem::take(&mut *slot)
        };

        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(async move {
                session.close().await;
                tracing::debug!(upstream = %session.id(), "Upstream closed");
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Snapshot of every session, in config order.
    pub async fn snapshot(&self) -> Vec<Arc<UpstreamSession>> {
        self.sessions.read().await.clone()
    }

    /// Snapshot of sessions currently in `Connected` state. Callers must
    /// not retain these across a `close_all`.
    pub async fn get_connected(&self) -> Vec<Arc<UpstreamSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|s| s.is_connected())
            .cloned()
            .collect()
    }

    pub async fn find(&self, id: &str) -> Option<Arc<UpstreamSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub async fn find_connected(&self, id: &str) -> Option<Arc<UpstreamSession>> {
        self.find(id).await.filter(|s| s.is_connected())
    }
}

/// Linear retry: up to `retryAttempts` attempts with a fixed
/// `retryDelayMs` pause, retrying transient failures only.
async fn connect_with_retries(session: &UpstreamSession) {
    let spec = session.spec();
    let attempts = spec.retry_attempts.max(1);

    for attempt in 1..=attempts {
        match session.connect().await {
            Ok(()) => return,
            Err(error) if error.transient && attempt < attempts => {
                tracing::warn!(
                    upstream = %session.id(),
                    attempt,
                    %error,
                    "Connect failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(spec.retry_delay_ms)).await;
            }
            Err(error) => {
                tracing::error!(
                    upstream = %session.id(),
                    attempt,
                    %error,
                    "Connect failed permanently"
                );
                return;
            }
        }
    }
}
