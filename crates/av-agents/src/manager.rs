//! Cached agent configurations kept in step with the repository.
//!
//! Every mutation follows the same shape: compute the new value, write it to
//! the cache, persist, and restore the previous value if persistence fails.
//! Mutations are serialized per agent id so a rollback can never clobber a
//! concurrent write to the same agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, error, info};

use av_core::{
    AgentConfig, AgentConfigInput, AgentConfigUpdate, AppEvent, Error, EventBus,
    FunctionToolRegistry, ToolConfig,
};
use av_store::AgentRepository;

pub struct AgentManager {
    repository: Arc<dyn AgentRepository>,
    functions: Arc<FunctionToolRegistry>,
    cache: RwLock<HashMap<String, AgentConfig>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: Option<EventBus>,
}

impl AgentManager {
    pub fn new(repository: Arc<dyn AgentRepository>, functions: Arc<FunctionToolRegistry>) -> Self {
        Self {
            repository,
            functions,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn functions(&self) -> &Arc<FunctionToolRegistry> {
        &self.functions
    }

    fn publish(&self, event: AppEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    fn cache_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentConfig>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentConfig>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Forget the lock of an id with no agent behind it, unless another
    /// caller already holds a handle to it.
    fn release_lock(&self, id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        if self.has_agent(id) {
            return;
        }
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Replace the cache with the repository contents. On failure the cache
    /// stays empty. Returns the number of agents loaded.
    pub async fn load_agents_from_database(&self) -> usize {
        self.cache_write().clear();

        match self.repository.list().await {
            Ok(agents) => {
                let count = agents.len();
                {
                    let mut cache = self.cache_write();
                    for agent in agents {
                        cache.insert(agent.id.clone(), agent);
                    }
                }
                info!(count, "Loaded agents");
                self.publish(AppEvent::AgentsChanged);
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to load agents from database");
                0
            }
        }
    }

    pub fn get_agent(&self, id: &str) -> Option<AgentConfig> {
        self.cache_read().get(id).cloned()
    }

    /// All cached agents, oldest first.
    pub fn list_agents(&self) -> Vec<AgentConfig> {
        let mut agents: Vec<AgentConfig> = self.cache_read().values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    pub fn has_agent(&self, id: &str) -> bool {
        self.cache_read().contains_key(id)
    }

    pub fn list_tools(&self, agent_id: &str) -> Result<Vec<ToolConfig>, Error> {
        self.cache_read()
            .get(agent_id)
            .map(|a| a.tools.clone())
            .ok_or_else(|| Error::not_found("agent", agent_id))
    }

    /// Apply a change to one cache entry and persist it.
    ///
    /// `change` sees the current entry and returns the replacement (`None`
    /// deletes). A `change` error aborts before anything is written. If
    /// persistence fails the previous entry is restored and the error
    /// returned. Subscribers are notified only after a successful write.
    async fn commit<F>(&self, id: &str, change: F) -> Result<Option<AgentConfig>, Error>
    where
        F: FnOnce(Option<&AgentConfig>) -> Result<Option<AgentConfig>, Error>,
    {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        let outcome = self.apply(id, change).await;
        drop(guard);
        self.release_lock(id, &lock);
        outcome
    }

    async fn apply<F>(&self, id: &str, change: F) -> Result<Option<AgentConfig>, Error>
    where
        F: FnOnce(Option<&AgentConfig>) -> Result<Option<AgentConfig>, Error>,
    {
        let snapshot = self.get_agent(id);
        let next = change(snapshot.as_ref())?;

        {
            let mut cache = self.cache_write();
            match &next {
                Some(config) => cache.insert(id.to_string(), config.clone()),
                None => cache.remove(id),
            };
        }

        let persisted = match &next {
            Some(config) => self.repository.upsert(config).await,
            None => self.repository.remove(id).await,
        };

        if let Err(e) = persisted {
            error!(agent = %id, error = %e, "Persisting agent failed, rolling back");
            let mut cache = self.cache_write();
            match snapshot {
                Some(previous) => cache.insert(id.to_string(), previous),
                None => cache.remove(id),
            };
            return Err(e);
        }

        self.publish(AppEvent::AgentsChanged);
        Ok(next)
    }

    fn check_handoffs(&self, own_id: Option<&str>, handoff_ids: &[String]) -> Result<(), Error> {
        for target in handoff_ids {
            if Some(target.as_str()) == own_id {
                return Err(Error::validation("an agent cannot hand off to itself"));
            }
            if !self.has_agent(target) {
                return Err(Error::validation(format!("handoff target '{}' does not exist", target)));
            }
        }
        Ok(())
    }

    /// Executors are only required to exist when a tool is added on its
    /// own; tools arriving with a whole config are checked when built.
    fn check_tool(&self, own_id: &str, tool: &ToolConfig, require_executor: bool) -> Result<(), Error> {
        match tool {
            ToolConfig::Function(f) => {
                if require_executor && !self.functions.contains(f.executor_name()) {
                    return Err(Error::validation(format!(
                        "function tool '{}' references unregistered executor '{}'",
                        f.name,
                        f.executor_name()
                    )));
                }
            }
            ToolConfig::Agent(a) => {
                if a.target_agent_id == own_id {
                    return Err(Error::validation(format!(
                        "agent tool '{}' cannot target its own agent",
                        a.name
                    )));
                }
                if !self.has_agent(&a.target_agent_id) {
                    return Err(Error::validation(format!(
                        "agent tool '{}' targets unknown agent '{}'",
                        a.name, a.target_agent_id
                    )));
                }
            }
            ToolConfig::Hosted(_) => {}
        }
        Ok(())
    }

    pub async fn create_agent(&self, input: AgentConfigInput) -> Result<AgentConfig, Error> {
        input.validate()?;
        self.check_handoffs(None, &input.handoff_ids)?;
        for tool in &input.tools {
            self.check_tool("", tool, false)?;
        }

        let config = AgentConfig::from_input(input);
        let id = config.id.clone();
        let created = self
            .commit(&id, |_| Ok(Some(config)))
            .await?
            .ok_or_else(|| Error::Unknown("create produced no agent".into()))?;

        info!(agent = %id, name = %created.name, "Agent created");
        Ok(created)
    }

    pub async fn add_tool(&self, agent_id: &str, tool: ToolConfig) -> Result<AgentConfig, Error> {
        let updated = self
            .commit(agent_id, |current| {
                let current = current.ok_or_else(|| Error::not_found("agent", agent_id))?;
                if current.tool(tool.name()).is_some() {
                    return Err(Error::conflict(format!(
                        "tool '{}' already exists on agent '{}'",
                        tool.name(),
                        current.name
                    )));
                }
                self.check_tool(agent_id, &tool, true)?;

                let mut next = current.clone();
                next.tools.push(tool);
                next.touch();
                Ok(Some(next))
            })
            .await?;

        debug!(agent = %agent_id, "Tool added");
        updated.ok_or_else(|| Error::not_found("agent", agent_id))
    }

    pub async fn remove_tool(&self, agent_id: &str, tool_name: &str) -> Result<AgentConfig, Error> {
        let updated = self
            .commit(agent_id, |current| {
                let current = current.ok_or_else(|| Error::not_found("agent", agent_id))?;
                let index = current
                    .tools
                    .iter()
                    .position(|t| t.name() == tool_name)
                    .ok_or_else(|| Error::not_found("tool", tool_name))?;

                let mut next = current.clone();
                next.tools.remove(index);
                next.touch();
                Ok(Some(next))
            })
            .await?;

        debug!(agent = %agent_id, tool = %tool_name, "Tool removed");
        updated.ok_or_else(|| Error::not_found("agent", agent_id))
    }

    /// Merge a partial update. The cache entry is replaced with a new value
    /// even when only one field changes.
    pub async fn update_agent(
        &self,
        id: &str,
        update: AgentConfigUpdate,
    ) -> Result<AgentConfig, Error> {
        update.validate()?;
        if let Some(handoffs) = &update.handoff_ids {
            self.check_handoffs(Some(id), handoffs)?;
        }
        if let Some(tools) = &update.tools {
            for tool in tools {
                self.check_tool(id, tool, false)?;
            }
        }

        let updated = self
            .commit(id, |current| {
                let current = current.ok_or_else(|| Error::not_found("agent", id))?;
                let mut next = current.clone();
                update.apply_to(&mut next);
                next.touch();
                Ok(Some(next))
            })
            .await?;

        info!(agent = %id, "Agent updated");
        updated.ok_or_else(|| Error::not_found("agent", id))
    }

    pub async fn delete_agent(&self, id: &str) -> Result<(), Error> {
        self.commit(id, |current| match current {
            Some(_) => Ok(None),
            None => Err(Error::not_found("agent", id)),
        })
        .await?;

        info!(agent = %id, "Agent deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::testing::EchoExecutor;
    use av_core::{AgentToolConfig, FunctionToolConfig, HostedToolConfig, ModelConfig};
    use av_store::MemoryAgentRepository;
    use serde_json::json;

    fn setup() -> (AgentManager, Arc<MemoryAgentRepository>) {
        let repo = Arc::new(MemoryAgentRepository::new());
        let functions = FunctionToolRegistry::new().with("echo", Arc::new(EchoExecutor));
        let manager = AgentManager::new(repo.clone(), Arc::new(functions));
        (manager, repo)
    }

    fn input(name: &str) -> AgentConfigInput {
        AgentConfigInput::new(name, "x", ModelConfig::new("openai-default", "gpt-5"))
    }

    fn echo_tool() -> ToolConfig {
        ToolConfig::Function(FunctionToolConfig::new("echo"))
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (manager, repo) = setup();
        let created = manager.create_agent(input("A")).await.unwrap();

        let fetched = manager.get_agent(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.created_at, fetched.updated_at);
        assert_eq!(fetched.id.len(), 36);
        assert!(repo.get(&created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (manager, repo) = setup();
        for bad in [input(""), input(&"n".repeat(101)), AgentConfigInput::new("A", " ", ModelConfig::new("p", "m"))] {
            let err = manager.create_agent(bad).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert!(manager.list_agents().is_empty());
        assert_eq!(repo.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_persist_failure() {
        let (manager, repo) = setup();
        repo.fail_next_upserts(1);

        let err = manager.create_agent(input("A")).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(manager.list_agents().is_empty());
    }

    #[tokio::test]
    async fn test_add_tool_conflict_and_unregistered_executor() {
        let (manager, _) = setup();
        let agent = manager.create_agent(input("A")).await.unwrap();
        manager.add_tool(&agent.id, echo_tool()).await.unwrap();

        let err = manager.add_tool(&agent.id, echo_tool()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut unknown = FunctionToolConfig::new("search");
        unknown.executor = Some("not-registered".into());
        let err = manager
            .add_tool(&agent.id, ToolConfig::Function(unknown))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(manager.list_tools(&agent.id).unwrap(), vec![echo_tool()]);
    }

    #[tokio::test]
    async fn test_add_tool_to_missing_agent() {
        let (manager, _) = setup();
        let err = manager.add_tool("nope", echo_tool()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.list_tools("nope").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_agent_tool_requires_known_target() {
        let (manager, _) = setup();
        let agent = manager.create_agent(input("A")).await.unwrap();
        let tool = |target: &str| {
            ToolConfig::Agent(AgentToolConfig {
                name: "ask".into(),
                description: String::new(),
                target_agent_id: target.into(),
                enabled: true,
            })
        };

        assert!(matches!(
            manager.add_tool(&agent.id, tool("ghost")).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            manager.add_tool(&agent.id, tool(&agent.id)).await,
            Err(Error::Validation(_))
        ));

        let other = manager.create_agent(input("B")).await.unwrap();
        manager.add_tool(&agent.id, tool(&other.id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_tool_rollback_restores_list() {
        let (manager, repo) = setup();
        let agent = manager.create_agent(input("A")).await.unwrap();
        repo.fail_next_upserts(1);

        let err = manager.add_tool(&agent.id, echo_tool()).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(manager.list_tools(&agent.id).unwrap().is_empty());
        assert_eq!(manager.get_agent(&agent.id).unwrap(), agent);
    }

    #[tokio::test]
    async fn test_remove_then_add_round_trip() {
        let (manager, _) = setup();
        let hosted = ToolConfig::Hosted(HostedToolConfig {
            name: "web_search".into(),
            provider_data: json!({}),
            enabled: true,
        });
        let agent = manager
            .create_agent(input("A").with_tool(hosted).with_tool(echo_tool()))
            .await
            .unwrap();
        let original = manager.list_tools(&agent.id).unwrap();

        manager.remove_tool(&agent.id, "echo").await.unwrap();
        assert_eq!(manager.list_tools(&agent.id).unwrap().len(), 1);
        manager.add_tool(&agent.id, echo_tool()).await.unwrap();

        assert_eq!(manager.list_tools(&agent.id).unwrap(), original);
    }

    #[tokio::test]
    async fn test_remove_tool_rollback_keeps_position() {
        let (manager, repo) = setup();
        let hosted = ToolConfig::Hosted(HostedToolConfig {
            name: "web_search".into(),
            provider_data: json!({}),
            enabled: true,
        });
        let agent = manager
            .create_agent(input("A").with_tool(echo_tool()).with_tool(hosted))
            .await
            .unwrap();

        repo.fail_next_upserts(1);
        assert!(manager.remove_tool(&agent.id, "echo").await.is_err());
        let names: Vec<String> = manager
            .list_tools(&agent.id)
            .unwrap()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["echo", "web_search"]);
    }

    #[tokio::test]
    async fn test_update_replaces_and_rolls_back() {
        let (manager, repo) = setup();
        let agent = manager.create_agent(input("A")).await.unwrap();

        let update = AgentConfigUpdate {
            name: Some("Renamed".into()),
            ..Default::default()
        };
        let updated = manager.update_agent(&agent.id, update).await.unwrap();
        assert_eq!(updated.name, "Renamed");
        assert!(updated.updated_at >= updated.created_at);

        repo.fail_next_upserts(1);
        let update = AgentConfigUpdate {
            instructions: Some("new".into()),
            ..Default::default()
        };
        assert!(manager.update_agent(&agent.id, update).await.is_err());
        assert_eq!(manager.get_agent(&agent.id).unwrap(), updated);
    }

    #[tokio::test]
    async fn test_update_rejects_self_handoff() {
        let (manager, _) = setup();
        let agent = manager.create_agent(input("A")).await.unwrap();
        let update = AgentConfigUpdate {
            handoff_ids: Some(vec![agent.id.clone()]),
            ..Default::default()
        };
        assert!(matches!(
            manager.update_agent(&agent.id, update).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_rollback_and_success() {
        let (manager, repo) = setup();
        let agent = manager.create_agent(input("A")).await.unwrap();

        repo.fail_next_removes(1);
        assert!(manager.delete_agent(&agent.id).await.is_err());
        assert!(manager.get_agent(&agent.id).is_some());

        manager.delete_agent(&agent.id).await.unwrap();
        assert!(manager.get_agent(&agent.id).is_none());
        assert!(manager.delete_agent(&agent.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_deleted_agents_release_their_locks() {
        let (manager, _) = setup();
        let kept = manager.create_agent(input("A")).await.unwrap();
        let gone = manager.create_agent(input("B")).await.unwrap();
        let update = AgentConfigUpdate {
            name: Some("B2".into()),
            ..Default::default()
        };
        manager.update_agent(&gone.id, update).await.unwrap();
        assert_eq!(manager.lock_count(), 2);

        manager.delete_agent(&gone.id).await.unwrap();
        assert_eq!(manager.lock_count(), 1);

        assert!(manager.delete_agent("no-such-agent").await.is_err());
        assert_eq!(manager.lock_count(), 1);
        assert!(manager.has_agent(&kept.id));
    }

    #[tokio::test]
    async fn test_events_only_after_successful_write() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let repo = Arc::new(MemoryAgentRepository::new());
        let manager = AgentManager::new(repo.clone(), Arc::new(FunctionToolRegistry::new()))
            .with_events(bus);

        repo.fail_next_upserts(1);
        assert!(manager.create_agent(input("A")).await.is_err());
        assert!(rx.try_recv().is_err());

        manager.create_agent(input("A")).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), AppEvent::AgentsChanged);
    }

    #[tokio::test]
    async fn test_load_failure_leaves_cache_empty() {
        let (manager, repo) = setup();
        manager.create_agent(input("A")).await.unwrap();

        repo.fail_next_lists(1);
        assert_eq!(manager.load_agents_from_database().await, 0);
        assert!(manager.list_agents().is_empty());

        assert_eq!(manager.load_agents_from_database().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_on_one_agent_are_serialized() {
        let (manager, repo) = setup();
        let manager = Arc::new(manager);
        let agent = manager.create_agent(input("A")).await.unwrap();

        // First write fails and rolls back; the second must not be undone by it.
        repo.fail_next_upserts(1);
        let m1 = manager.clone();
        let id1 = agent.id.clone();
        let first = tokio::spawn(async move { m1.add_tool(&id1, echo_tool()).await });
        let m2 = manager.clone();
        let id2 = agent.id.clone();
        let second = tokio::spawn(async move {
            m2.update_agent(
                &id2,
                AgentConfigUpdate {
                    name: Some("B".into()),
                    ..Default::default()
                },
            )
            .await
        });

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(usize::from(first.is_err()) + usize::from(second.is_err()), 1);

        let cached = manager.get_agent(&agent.id).unwrap();
        let stored = repo.get(&agent.id).await.unwrap().unwrap();
        assert_eq!(cached, stored);
    }
}
