//! Session registry
//!
//! The only state shared across invocations. It maps `(owner, server)` to at
//! most one live [`Session`], creates Sessions lazily behind a per-key gate so
//! concurrent first calls share one handshake, reaps Sessions after the idle
//! window, and tears down all of an owner's Sessions on demand.

use crate::bridge::recording::RecordingState;
use crate::bridge::session::{Session, SessionKey, SessionSnapshot, TerminationHook};
use crate::config::{BridgeConfig, ServerConfig};
use crate::mcp::error::MCPOperationError;
use crate::mcp::transport::TransportProvider;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) type SharedRecording = Arc<tokio::sync::Mutex<RecordingState>>;

struct RegistryInner {
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
    gates: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Keyed like sessions but outliving them, so frames survive a replacement
    recordings: Mutex<HashMap<SessionKey, SharedRecording>>,
    settings: BridgeConfig,
    provider: Arc<dyn TransportProvider>,
}

impl RegistryInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recordings(&self) -> MutexGuard<'_, HashMap<SessionKey, SharedRecording>> {
        self.recordings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the entry only if it is still this exact Session
    fn forget(&self, key: &SessionKey, id: Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions();
        match sessions.get(key) {
            Some(current) if current.id() == id => sessions.remove(key),
            _ => None,
        }
    }
}

/// Owner of every live Session
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(settings: BridgeConfig, provider: Arc<dyn TransportProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                recordings: Mutex::new(HashMap::new()),
                settings,
                provider,
            }),
        }
    }

    pub fn settings(&self) -> &BridgeConfig {
        &self.inner.settings
    }

    /// The Session for this key, if one is ready
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.inner
            .sessions()
            .get(key)
            .filter(|s| s.is_ready())
            .cloned()
    }

    /// A ready Session of this owner whose server namespace matches
    pub fn find_by_namespace(&self, owner_id: &str, namespace: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions()
            .values()
            .find(|s| {
                s.key().owner_id == owner_id && s.is_ready() && s.config().namespace() == namespace
            })
            .cloned()
    }

    /// Return the ready Session for this server, creating it if needed
    ///
    /// Concurrent callers for the same key wait on one creation. A dead or
    /// closing entry is torn down and replaced.
    pub async fn get_or_create(
        &self,
        config: &ServerConfig,
    ) -> Result<Arc<Session>, MCPOperationError> {
        let key = config.key();
        if let Some(session) = self.get(&key) {
            return Ok(session);
        }

        let gate = {
            let mut gates = self.inner.gates.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let result = {
            let _guard = gate.lock().await;
            self.create_locked(&key, config).await
        };

        {
            let mut gates = self.inner.gates.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the map and this call hold the gate: nobody is waiting on it
            if gates.get(&key).map_or(false, |g| Arc::strong_count(g) <= 2) {
                gates.remove(&key);
            }
        }
        result
    }

    async fn create_locked(
        &self,
        key: &SessionKey,
        config: &ServerConfig,
    ) -> Result<Arc<Session>, MCPOperationError> {
        let stale = {
            let mut sessions = self.inner.sessions();
            match sessions.get(key) {
                Some(session) if session.is_ready() => return Ok(Arc::clone(session)),
                Some(_) => sessions.remove(key),
                None => None,
            }
        };
        if let Some(stale) = stale {
            debug!(session = %key, state = %stale.state(), "Replacing stale session");
            stale.close().await;
        }

        let transport = self.inner.provider.create(config, &self.inner.settings)?;
        let weak = Arc::downgrade(&self.inner);
        let hook: TerminationHook = Arc::new(move |key, id| {
            if let Some(inner) = weak.upgrade() {
                if inner.forget(key, id).is_some() {
                    info!(session = %key, session_id = %id, "Removed terminated session");
                }
            }
        });

        let session = Session::connect(
            Arc::new(config.clone()),
            &self.inner.settings,
            transport,
            hook,
        )
        .await?;

        self.inner
            .sessions()
            .insert(key.clone(), Arc::clone(&session));
        self.touch(&session);
        Ok(session)
    }

    /// Record activity and restart the idle timer
    ///
    /// Returns false if the Session stopped being ready meanwhile.
    pub fn touch(&self, session: &Arc<Session>) -> bool {
        session.mark_activity();
        let timer = tokio::spawn(idle_watch(
            Arc::downgrade(&self.inner),
            Arc::downgrade(session),
            self.inner.settings.idle_timeout,
        ));
        session.replace_idle_timer(timer);
        session.is_ready()
    }

    /// Drop a Session that failed, if it is still the registered one
    pub async fn discard(&self, session: &Arc<Session>) {
        if self.inner.forget(session.key(), session.id()).is_some() {
            debug!(session = %session.key(), "Discarding failed session");
        }
        session.close().await;
    }

    /// Close and remove the Session for this key; returns whether one existed
    pub async fn remove(&self, key: &SessionKey) -> bool {
        let removed = self.inner.sessions().remove(key);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every Session of one owner; returns how many were closed
    pub async fn close_all(&self, owner_id: &str) -> usize {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions();
            let keys: Vec<SessionKey> = sessions
                .keys()
                .filter(|k| k.owner_id == owner_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        self.inner
            .recordings()
            .retain(|k, _| k.owner_id != owner_id);
        let count = removed.len();
        join_all(removed.iter().map(|s| s.close())).await;
        if count > 0 {
            info!(owner = %owner_id, count, "Closed owner sessions");
        }
        count
    }

    /// Close every Session
    pub async fn shutdown(&self) {
        let removed: Vec<Arc<Session>> = self.inner.sessions().drain().map(|(_, s)| s).collect();
        self.inner.recordings().clear();
        let count = removed.len();
        join_all(removed.iter().map(|s| s.close())).await;
        info!(count, "Session registry shut down");
    }

    /// Recording state for this key, created inactive on first use
    pub(crate) fn recording(&self, key: &SessionKey) -> SharedRecording {
        let max_frames = self.inner.settings.max_recorded_frames;
        Arc::clone(
            self.inner
                .recordings()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(RecordingState::new(max_frames)))),
        )
    }

    /// Recording state for this key, if any was ever started
    pub(crate) fn existing_recording(&self, key: &SessionKey) -> Option<SharedRecording> {
        self.inner.recordings().get(key).cloned()
    }

    pub async fn is_recording(&self, key: &SessionKey) -> bool {
        match self.existing_recording(key) {
            Some(recording) => recording.lock().await.is_active(),
            None => false,
        }
    }

    /// Throw away recording state, e.g. when the server definition goes away
    pub(crate) fn drop_recording(&self, key: &SessionKey) {
        self.inner.recordings().remove(key);
    }

    /// Snapshots of one owner's registered Sessions, sorted by key
    pub async fn live_sessions(&self, owner_id: &str) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<Arc<Session>> = self
            .inner
            .sessions()
            .values()
            .filter(|s| s.key().owner_id == owner_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.key().cmp(b.key()));
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let recording = self.is_recording(session.key()).await;
            snapshots.push(session.snapshot(recording));
        }
        snapshots
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }
}

async fn idle_watch(registry: Weak<RegistryInner>, session: Weak<Session>, idle: Duration) {
    loop {
        tokio::time::sleep(idle).await;

        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.is_ready() {
            return;
        }
        let pending = session.pending_requests().await;
        if pending > 0 {
            debug!(session = %session.key(), pending, "Idle window elapsed with calls in flight, rescheduling");
            continue;
        }

        // Closing must not cancel this very task
        session.detach_idle_timer();
        info!(
            session = %session.key(),
            idle_ms = idle.as_millis() as u64,
            "Closing idle session"
        );
        if let Some(registry) = registry.upgrade() {
            registry.forget(session.key(), session.id());
        }
        session.close().await;
        return;
    }
}
