//! Chat state shared with the front end, and the send pipeline.
//!
//! The front end reads [`ChatState`] through a watch channel and calls the
//! store's methods; it never mutates state itself.
//!
//! Every send captures the store's epoch. Switching agent, model or session
//! advances the epoch, and results from a send whose epoch is no longer
//! current are dropped instead of being applied to the new conversation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use av_agents::{AgentManager, AgentService};
use av_core::definition::new_id;
use av_core::{AgentInputItem, Error, EventBus, RunEvent, Runner};
use av_providers::{split_model_key, ModelGroup, ProviderManager};
use av_session::{ChatSession, SessionManager};
use av_store::SessionSummary;

const TITLE_CHARS: usize = 50;
const NO_CONTENT: &str = "No content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    /// Agent that produced an assistant message, when known
    pub agent_name: Option<String>,
    pub streaming: bool,
    pub is_error: bool,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            agent_name: None,
            streaming: false,
            is_error: false,
        }
    }

    fn placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::new(ChatRole::Assistant, "")
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(ChatRole::Assistant, message)
        }
    }

    fn from_item(item: &AgentInputItem) -> Option<Self> {
        match item {
            AgentInputItem::UserMessage { content } => Some(Self::new(ChatRole::User, content.as_str())),
            AgentInputItem::AssistantMessage { content, agent, .. } => Some(Self {
                agent_name: agent.clone(),
                ..Self::new(ChatRole::Assistant, content.as_str())
            }),
            _ => None,
        }
    }

    fn to_item(&self) -> AgentInputItem {
        match self.role {
            ChatRole::User => AgentInputItem::user(self.content.as_str()),
            ChatRole::Assistant => AgentInputItem::assistant(self.content.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOption {
    pub id: String,
    pub name: String,
}

/// Everything the front end renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub selected_agent_id: Option<String>,
    pub selected_model_key: Option<String>,
    pub is_loading: bool,
    pub current_session_id: Option<String>,
    pub sessions: Vec<SessionSummary>,
    pub agents: Vec<AgentOption>,
    pub model_groups: Vec<ModelGroup>,
    pub can_send: bool,
}

impl ChatState {
    fn update_can_send(&mut self) {
        self.can_send = self.selected_agent_id.is_some()
            && self.selected_model_key.is_some()
            && !self.is_loading;
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

pub struct ChatStore {
    agents: Arc<AgentManager>,
    providers: Arc<ProviderManager>,
    service: Arc<AgentService>,
    sessions: Arc<SessionManager>,
    state: watch::Sender<ChatState>,
    session: Mutex<Option<Arc<ChatSession>>>,
    epoch: AtomicU64,
    default_agent_id: Option<String>,
    default_model_key: Option<String>,
}

impl ChatStore {
    pub fn new(
        service: Arc<AgentService>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let (state, _) = watch::channel(ChatState::default());
        Self {
            agents: service.agents().clone(),
            providers: service.providers().clone(),
            service,
            sessions,
            state,
            session: Mutex::new(None),
            epoch: AtomicU64::new(0),
            default_agent_id: None,
            default_model_key: None,
        }
    }

    /// Selections applied by [`ChatStore::refresh`] while nothing is selected.
    pub fn with_defaults(mut self, agent_id: Option<String>, model_key: Option<String>) -> Self {
        self.default_agent_id = agent_id;
        self.default_model_key = model_key;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut ChatState)) {
        self.state.send_modify(|state| {
            f(state);
            state.update_can_send();
        });
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Supersede any in-flight send.
    fn advance_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.update(|state| state.is_loading = false);
    }

    fn current_session(&self) -> Option<Arc<ChatSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: Option<Arc<ChatSession>>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Re-read agents, models and sessions, then fill in missing selections.
    pub async fn refresh(&self) {
        let agents: Vec<AgentOption> = self
            .agents
            .list_agents()
            .into_iter()
            .map(|a| AgentOption { id: a.id, name: a.name })
            .collect();
        let model_groups = self.providers.available_model_groups().await;
        let sessions = match self.sessions.list(None).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to list sessions");
                Vec::new()
            }
        };

        let default_agent = self.default_agent_id.clone();
        let default_model = self.default_model_key.clone();
        self.update(move |state| {
            let agent_known = |id: &String| agents.iter().any(|a| &a.id == id);
            if !state.selected_agent_id.as_ref().is_some_and(agent_known) {
                state.selected_agent_id = default_agent
                    .filter(agent_known)
                    .or_else(|| agents.first().map(|a| a.id.clone()));
            }

            if state.selected_model_key.is_none() {
                let first = model_groups
                    .iter()
                    .flat_map(|g| g.models.first())
                    .map(|m| m.key.clone())
                    .next();
                state.selected_model_key = default_model.or(first);
            }

            state.agents = agents;
            state.model_groups = model_groups;
            state.sessions = sessions;
        });
    }

    /// Refresh whenever an application event arrives. The task ends when the
    /// store is dropped or the bus closes.
    pub fn watch_events(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        debug!(?event, "Refreshing chat state");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Chat state refresh lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
                let Some(store) = store.upgrade() else {
                    return;
                };
                store.refresh().await;
            }
        })
    }

    pub fn select_agent(&self, agent_id: &str) -> Result<(), Error> {
        if !self.agents.has_agent(agent_id) {
            return Err(Error::not_found("agent", agent_id));
        }
        self.advance_epoch();
        let id = agent_id.to_string();
        self.update(move |state| state.selected_agent_id = Some(id));
        Ok(())
    }

    pub fn select_model(&self, model_key: &str) -> Result<(), Error> {
        if split_model_key(model_key).is_none() {
            return Err(Error::validation(format!(
                "model key '{}' is not of the form <provider>:<model>",
                model_key
            )));
        }
        self.advance_epoch();
        let key = model_key.to_string();
        self.update(move |state| state.selected_model_key = Some(key));
        Ok(())
    }

    /// Start an empty conversation. The session row is created on first send.
    pub fn new_session(&self) {
        self.advance_epoch();
        self.set_session(None);
        self.update(|state| {
            state.messages.clear();
            state.current_session_id = None;
        });
    }

    pub async fn open_session(&self, session_id: &str) -> Result<(), Error> {
        self.advance_epoch();
        let session = self.sessions.open(session_id).await?;
        let messages: Vec<ChatMessage> = session
            .get_items(None)
            .await?
            .iter()
            .filter_map(ChatMessage::from_item)
            .collect();

        self.set_session(Some(session));
        let id = session_id.to_string();
        self.update(move |state| {
            state.messages = messages;
            state.current_session_id = Some(id);
        });
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), Error> {
        if self.snapshot().current_session_id.as_deref() == Some(session_id) {
            self.new_session();
        }
        self.sessions.delete(session_id).await?;
        self.refresh().await;
        Ok(())
    }

    async fn ensure_session(&self, first_message: &str) -> Result<Arc<ChatSession>, Error> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        let title = session_title(first_message);
        let session = self.sessions.create(Some(title.as_str())).await?;
        self.set_session(Some(session.clone()));

        let id = session.id().to_string();
        self.update(move |state| state.current_session_id = Some(id));
        Ok(session)
    }

    /// Send a user message to the selected agent and stream the answer into
    /// the state. Failures end up as an error message in the conversation;
    /// the returned error is for logging.
    pub async fn send_message(&self, text: &str) -> Result<(), Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::validation("message is empty"));
        }

        let snapshot = self.snapshot();
        let (Some(agent_id), Some(model_key)) =
            (snapshot.selected_agent_id.clone(), snapshot.selected_model_key.clone())
        else {
            return Err(Error::validation("select an agent and a model first"));
        };
        if !snapshot.can_send {
            return Err(Error::validation("a message is already being answered"));
        }

        let epoch = self.current_epoch();
        let user = ChatMessage::new(ChatRole::User, text);
        let placeholder = ChatMessage::placeholder();
        let placeholder_id = placeholder.id.clone();
        self.update(|state| {
            state.messages.push(user);
            state.messages.push(placeholder);
            state.is_loading = true;
        });

        let outcome = self
            .stream_reply(text, &agent_id, &model_key, &placeholder_id, epoch)
            .await;

        if self.current_epoch() != epoch {
            debug!(agent = %agent_id, "Discarding result of superseded send");
            // The conversation may still show the placeholder if only the
            // selection changed
            self.update(|state| {
                let empty = state
                    .message_mut(&placeholder_id)
                    .is_some_and(|m| m.content.is_empty());
                if empty {
                    state.messages.retain(|m| m.id != placeholder_id);
                } else if let Some(m) = state.message_mut(&placeholder_id) {
                    m.streaming = false;
                }
            });
            return outcome.map(|_| ());
        }

        match outcome {
            Ok(reply) => {
                if let Some(session) = self.current_session() {
                    if let Err(e) = session.add_items(vec![reply]).await {
                        warn!(session = %session.id(), error = %e, "Failed to save reply");
                    }
                }
                self.update(|state| state.is_loading = false);
                self.refresh().await;
                Ok(())
            }
            Err(e) => {
                warn!(agent = %agent_id, model = %model_key, error = %e, "Send failed");
                self.update(|state| {
                    let empty = state
                        .message_mut(&placeholder_id)
                        .is_some_and(|m| m.content.is_empty());
                    if empty {
                        state.messages.retain(|m| m.id != placeholder_id);
                    } else if let Some(m) = state.message_mut(&placeholder_id) {
                        m.streaming = false;
                    }
                    state.messages.push(ChatMessage::error(format!("Error: {}", e)));
                    state.is_loading = false;
                });
                Err(e)
            }
        }
    }

    /// Run the agent and fill the placeholder. Returns the assistant item to
    /// persist.
    async fn stream_reply(
        &self,
        text: &str,
        agent_id: &str,
        model_key: &str,
        placeholder_id: &str,
        epoch: u64,
    ) -> Result<AgentInputItem, Error> {
        let input = match self.ensure_session(text).await {
            Ok(session) => {
                session.add_items(vec![AgentInputItem::user(text)]).await?;
                session.get_items(None).await?
            }
            Err(e) => {
                warn!(error = %e, "Session unavailable; sending visible conversation");
                self.visible_input(placeholder_id)
            }
        };

        let config = self
            .agents
            .get_agent(agent_id)
            .ok_or_else(|| Error::not_found("agent", agent_id))?;
        let (provider_id, model_id) = split_model_key(model_key)
            .ok_or_else(|| Error::validation(format!("invalid model key '{}'", model_key)))?;
        let agent = self
            .service
            .build(&config, Some(provider_id), Some(model_id))
            .await
            .ok_or_else(|| Error::config(format!("agent '{}' could not be built", config.name)))?;

        let mut runner = Runner::new();
        if let Some(session) = self.current_session() {
            runner = runner.with_session(session.id());
        }
        info!(agent = %config.name, model = %model_key, items = input.len(), "Sending message");

        let mut stream = runner.run_streamed(agent, input);
        let mut result = None;
        let mut streamed = false;

        while let Some(event) = stream.next().await {
            if self.current_epoch() != epoch {
                return Err(Error::Cancelled);
            }
            match event? {
                RunEvent::TextDelta { delta } => {
                    if delta.is_empty() {
                        continue;
                    }
                    streamed = true;
                    self.update(|state| {
                        if let Some(m) = state.message_mut(placeholder_id) {
                            m.content.push_str(&delta);
                        }
                    });
                }
                RunEvent::AgentUpdated { agent_name } => {
                    self.update(|state| {
                        if let Some(m) = state.message_mut(placeholder_id) {
                            m.agent_name = Some(agent_name);
                        }
                    });
                }
                RunEvent::ToolCalled { tool_name, .. } => {
                    debug!(tool = %tool_name, "Tool called");
                }
                RunEvent::Completed(done) => result = Some(done),
                RunEvent::ReasoningDelta { .. } | RunEvent::ToolOutput { .. } => {}
            }
        }
        let result = result.ok_or_else(|| Error::stream("run ended without a result"))?;

        let mut content = String::new();
        self.update(|state| {
            if let Some(m) = state.message_mut(placeholder_id) {
                if !streamed || m.content.is_empty() {
                    m.content = result
                        .final_text()
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .or_else(|| extract_content(&result.final_output))
                        .unwrap_or_else(|| NO_CONTENT.to_string());
                }
                m.agent_name = Some(result.last_agent.clone());
                m.streaming = false;
                content = m.content.clone();
            }
        });

        Ok(AgentInputItem::assistant_from(result.last_agent, content))
    }

    /// Input rebuilt from the messages on screen, for when there is no
    /// session to read history from.
    fn visible_input(&self, placeholder_id: &str) -> Vec<AgentInputItem> {
        self.state
            .borrow()
            .messages
            .iter()
            .filter(|m| m.id != placeholder_id && !m.is_error)
            .map(ChatMessage::to_item)
            .collect()
    }

    /// Save open sessions before exit.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.advance_epoch();
        self.sessions.dispose_all().await
    }
}

/// Session name derived from its first message.
pub fn session_title(first_message: &str) -> String {
    let line = first_message.lines().next().unwrap_or_default().trim();
    let title: String = line.chars().take(TITLE_CHARS).collect();
    if title.is_empty() {
        "New chat".to_string()
    } else {
        title.trim_end().to_string()
    }
}

/// Best-effort text from a structured run output.
pub fn extract_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => ["content", "text", "output", "finalOutput", "message"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(extract_content)
            .or_else(|| {
                if map.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(extract_content).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}
