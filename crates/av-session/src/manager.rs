//! Lifecycle of the sessions in a vault.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use av_core::definition::new_id;
use av_core::{AppEvent, Error, EventBus};
use av_store::{SessionRepository, SessionSummary};

use crate::session::{AutosaveConfig, ChatSession};

/// Creates, opens and deletes sessions. Each open session is a single shared
/// [`ChatSession`] instance per id.
pub struct SessionManager {
    repository: Arc<dyn SessionRepository>,
    config: AutosaveConfig,
    open: Mutex<HashMap<String, Arc<ChatSession>>>,
    events: Option<EventBus>,
}

impl SessionManager {
    pub fn new(repository: Arc<dyn SessionRepository>, config: AutosaveConfig) -> Self {
        Self {
            repository,
            config,
            open: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self) {
        if let Some(bus) = &self.events {
            bus.publish(AppEvent::SessionsChanged);
        }
    }

    /// Start a new, empty session.
    pub async fn create(&self, name: Option<&str>) -> Result<Arc<ChatSession>, Error> {
        let session = ChatSession::new(
            new_id(),
            name.map(str::to_string),
            self.repository.clone(),
            self.config,
        );
        session.ensure_loaded().await?;

        self.open
            .lock()
            .await
            .insert(session.id().to_string(), session.clone());
        info!(session = %session.id(), "Session created");
        self.publish();
        Ok(session)
    }

    /// The open instance for `id`, loading it on first use.
    pub async fn open(&self, id: &str) -> Result<Arc<ChatSession>, Error> {
        let mut open = self.open.lock().await;
        if let Some(session) = open.get(id) {
            return Ok(session.clone());
        }

        let summary = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("session", id))?;
        let session = ChatSession::new(id, summary.name, self.repository.clone(), self.config);
        session.ensure_loaded().await?;

        open.insert(id.to_string(), session.clone());
        debug!(session = %id, "Session opened");
        Ok(session)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<(), Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("session name must not be empty"));
        }
        self.repository.rename(id, name).await?;
        self.publish();
        Ok(())
    }

    /// Delete a session and anything still buffered for it.
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        if let Some(session) = self.open.lock().await.remove(id) {
            session.discard();
        }
        self.repository.remove(id).await?;
        info!(session = %id, "Session deleted");
        self.publish();
        Ok(())
    }

    /// Stored sessions, most recently updated first.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<SessionSummary>, Error> {
        self.repository.list(limit).await
    }

    /// Delete every session. Returns how many were removed.
    pub async fn clear_all(&self) -> Result<usize, Error> {
        for (_, session) in self.open.lock().await.drain() {
            session.discard();
        }

        let sessions = self.repository.list(None).await?;
        for summary in &sessions {
            self.repository.remove(&summary.id).await?;
        }
        info!(count = sessions.len(), "All sessions cleared");
        self.publish();
        Ok(sessions.len())
    }

    /// Save and close every open session. Sessions that fail to save stay
    /// open; the last error is returned.
    pub async fn dispose_all(&self) -> Result<(), Error> {
        let mut open = self.open.lock().await;
        let mut result = Ok(());
        let ids: Vec<String> = open.keys().cloned().collect();

        for id in ids {
            let Some(session) = open.get(&id).cloned() else {
                continue;
            };
            match session.dispose().await {
                Ok(()) => {
                    open.remove(&id);
                }
                Err(e) => {
                    warn!(session = %id, error = %e, "Session kept open after failed save");
                    result = Err(e);
                }
            }
        }
        result
    }
}
