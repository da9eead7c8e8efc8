//! A chat session log with write-behind persistence.
//!
//! Items are appended to an in-memory history (used for reads) and to a
//! buffer of items not yet written. The buffer is flushed to the repository
//! when it reaches `max_buffer` items, or `interval` after the first unflushed
//! append, whichever comes first. A failed flush puts its batch back at the
//! front of the buffer and retries after `retry_delay`.
//!
//! At most one write to the repository is in flight per session. Flushes,
//! durable pops and clears all take the same flush slot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use av_core::{AgentInputItem, Error};
use av_store::SessionRepository;

/// Autosave tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    #[serde(rename = "autosave_interval_ms")]
    pub interval_ms: u64,
    #[serde(rename = "autosave_max_buffer")]
    pub max_buffer: usize,
    pub retry_cap_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_buffer: 20,
            retry_cap_ms: 15_000,
        }
    }
}

impl AutosaveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delay before retrying after `attempt` consecutive failed flushes:
    /// the interval doubled per attempt, capped at `retry_cap_ms`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(self.interval_ms.saturating_mul(factor).min(self.retry_cap_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ItemsAdded { count: usize },
    Flushed { count: usize },
    FlushFailed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Idle,
    Flushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Unloaded,
    Loaded,
}

struct State {
    load: LoadState,
    history: Vec<AgentInputItem>,
    // Unwritten suffix of `history`, oldest first
    buffer: Vec<AgentInputItem>,
    timer: Option<JoinHandle<()>>,
    // Consecutive failed flushes
    failures: u32,
    disposed: bool,
}

pub struct ChatSession {
    id: String,
    name: Option<String>,
    repository: Arc<dyn SessionRepository>,
    config: AutosaveConfig,
    state: Mutex<State>,
    // Serializes the first load
    loading: tokio::sync::Mutex<()>,
    flush_state: watch::Sender<FlushState>,
    events: Mutex<Option<broadcast::Sender<SessionEvent>>>,
    this: Weak<ChatSession>,
}

impl ChatSession {
    pub fn new(
        id: impl Into<String>,
        name: Option<String>,
        repository: Arc<dyn SessionRepository>,
        config: AutosaveConfig,
    ) -> Arc<Self> {
        let id = id.into();
        let (flush_state, _) = watch::channel(FlushState::Idle);
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|this| Self {
            id,
            name,
            repository,
            config,
            state: Mutex::new(State {
                load: LoadState::Unloaded,
                history: Vec::new(),
                buffer: Vec::new(),
                timer: None,
                failures: 0,
                disposed: false,
            }),
            loading: tokio::sync::Mutex::new(()),
            flush_state,
            events: Mutex::new(Some(events)),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn config(&self) -> &AutosaveConfig {
        &self.config
    }

    /// Session events, or `None` once the session is disposed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    pub fn is_loaded(&self) -> bool {
        self.state().load == LoadState::Loaded
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    /// Items waiting to be written.
    pub fn pending_count(&self) -> usize {
        self.state().buffer.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }

    /// Hydrate from the repository, creating the durable row if the session
    /// is new. Runs once per instance.
    pub async fn ensure_loaded(&self) -> Result<(), Error> {
        if self.is_loaded() {
            return Ok(());
        }
        let _loading = self.loading.lock().await;
        if self.is_loaded() {
            return Ok(());
        }

        let items = if self.repository.exists(&self.id).await? {
            self.repository.get_items(&self.id, None).await?
        } else {
            self.repository.create(&self.id, self.name.as_deref()).await?;
            Vec::new()
        };

        debug!(session = %self.id, items = items.len(), "Session loaded");
        let mut state = self.state();
        state.history = items;
        state.load = LoadState::Loaded;
        Ok(())
    }

    /// Append items to the history and schedule them for writing.
    pub async fn add_items(&self, items: Vec<AgentInputItem>) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        self.ensure_loaded().await?;

        let count = items.len();
        let flush_now = {
            let mut state = self.state();
            if state.disposed {
                return Err(Error::invalid_request(format!(
                    "session {} is disposed",
                    self.id
                )));
            }
            state.history.extend(items.iter().cloned());
            state.buffer.extend(items);
            state.buffer.len() >= self.config.max_buffer
        };

        self.emit(SessionEvent::ItemsAdded { count });
        if flush_now {
            self.spawn_flush();
        } else {
            self.schedule(self.config.interval());
        }
        Ok(())
    }

    /// The most recent `limit` items, or the whole history.
    pub async fn get_items(&self, limit: Option<usize>) -> Result<Vec<AgentInputItem>, Error> {
        self.ensure_loaded().await?;
        let state = self.state();
        let skip = limit.map_or(0, |l| state.history.len().saturating_sub(l));
        Ok(state.history[skip..].to_vec())
    }

    /// Remove and return the most recent item.
    ///
    /// An item still buffered is dropped from the buffer and never written.
    /// An item already written is removed from the repository as well.
    pub async fn pop_item(&self) -> Result<Option<AgentInputItem>, Error> {
        self.ensure_loaded().await?;
        let slot = self.claim().await;

        let (item, written) = {
            let mut state = self.state();
            let Some(item) = state.history.pop() else {
                return Ok(None);
            };
            // The buffer is a suffix of the history, so its last item is this one
            let written = state.buffer.pop().is_none();
            (item, written)
        };

        if written {
            if let Err(e) = self.repository.pop_item(&self.id).await {
                self.state().history.push(item);
                return Err(e);
            }
        }
        drop(slot);
        debug!(session = %self.id, written, "Item popped");
        Ok(Some(item))
    }

    /// Drop every item, in memory and in the repository.
    pub async fn clear_session(&self) -> Result<(), Error> {
        self.ensure_loaded().await?;
        let _slot = self.claim().await;
        {
            let mut state = self.state();
            state.history.clear();
            state.buffer.clear();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        self.repository.clear(&self.id).await?;
        debug!(session = %self.id, "Session cleared");
        Ok(())
    }

    /// Write the buffer now. A call made while another write is in flight
    /// returns immediately with `Ok(0)`. Returns the number of items written.
    pub async fn flush(&self) -> Result<usize, Error> {
        match self.try_claim() {
            Some(slot) => self.write_buffer(slot).await,
            None => Ok(0),
        }
    }

    /// Write everything still buffered and release the event channel.
    ///
    /// Waits for an in-flight write first. On failure the session stays
    /// usable and the buffered items are kept.
    pub async fn dispose(&self) -> Result<(), Error> {
        if let Some(timer) = self.state().timer.take() {
            timer.abort();
        }

        let slot = self.claim().await;
        if let Err(e) = self.write_buffer(slot).await {
            error!(session = %self.id, error = %e, "Failed to save session on dispose");
            return Err(e);
        }

        self.state().disposed = true;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(session = %self.id, "Session disposed");
        Ok(())
    }

    /// Abandon the session without writing: used when it is being deleted.
    pub(crate) fn discard(&self) {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.buffer.clear();
        state.disposed = true;
        drop(state);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn try_claim(&self) -> Option<FlushSlot<'_>> {
        let claimed = self.flush_state.send_if_modified(|s| {
            if *s == FlushState::Idle {
                *s = FlushState::Flushing;
                true
            } else {
                false
            }
        });
        claimed.then(|| FlushSlot {
            session: self,
            batch: None,
        })
    }

    async fn claim(&self) -> FlushSlot<'_> {
        loop {
            if let Some(slot) = self.try_claim() {
                return slot;
            }
            let mut rx = self.flush_state.subscribe();
            // The sender lives as long as `self`
            let _ = rx.wait_for(|s| *s == FlushState::Idle).await;
        }
    }

    async fn write_buffer(&self, mut slot: FlushSlot<'_>) -> Result<usize, Error> {
        let batch = std::mem::take(&mut self.state().buffer);
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        // Held by the slot until the write succeeds; put back on drop otherwise
        let batch = slot.batch.insert(batch);
        match self.repository.append_items(&self.id, batch).await {
            Ok(()) => {
                slot.batch = None;
                drop(slot);
                debug!(session = %self.id, count, "Session flushed");
                self.emit(SessionEvent::Flushed { count });
                Ok(count)
            }
            Err(e) => {
                drop(slot);
                warn!(session = %self.id, count, error = %e, "Session flush failed; will retry");
                self.emit(SessionEvent::FlushFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Start the autosave timer unless one is already pending.
    fn schedule(&self, delay: Duration) {
        let mut state = self.state();
        if state.disposed || state.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let session = self.this.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            session.state().timer = None;
            // Failures are logged and rescheduled by the flush itself
            let _ = session.flush().await;
        }));
    }

    /// Flush in the background right away, replacing any pending timer.
    fn spawn_flush(&self) {
        if let Some(timer) = self.state().timer.take() {
            timer.abort();
        }
        let Some(session) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _ = session.flush().await;
        });
    }
}

/// Exclusive right to write to the repository for one session. Releasing it
/// restores an unwritten batch to the front of the buffer and makes sure
/// whatever is left buffered has a timer.
struct FlushSlot<'a> {
    session: &'a ChatSession,
    batch: Option<Vec<AgentInputItem>>,
}

impl Drop for FlushSlot<'_> {
    fn drop(&mut self) {
        let (pending, failures) = {
            let mut state = self.session.state();
            if let Some(mut batch) = self.batch.take() {
                batch.append(&mut state.buffer);
                state.buffer = batch;
                state.failures = state.failures.saturating_add(1);
            } else {
                state.failures = 0;
            }
            (!state.buffer.is_empty(), state.failures)
        };
        self.session.flush_state.send_replace(FlushState::Idle);

        if pending {
            let delay = if failures > 0 {
                self.session.config.retry_delay(failures)
            } else {
                self.session.config.interval()
            };
            self.session.schedule(delay);
        }
    }
}
