//! In-memory repositories with failure injection for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use av_core::definition::now_millis;
use av_core::{AgentConfig, AgentInputItem, Error};

use crate::{AgentRepository, SessionRepository, SessionSummary};

/// Consume one pending injected failure, if any.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory agent repository
#[derive(Default)]
pub struct MemoryAgentRepository {
    agents: RwLock<HashMap<String, AgentConfig>>,
    fail_upserts: AtomicUsize,
    fail_removes: AtomicUsize,
    fail_lists: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail with a persistence error.
    pub fn fail_next_upserts(&self, n: usize) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_removes(&self, n: usize) {
        self.fail_removes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.fail_lists.store(n, Ordering::SeqCst);
    }

    /// Number of successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRepository for MemoryAgentRepository {
    async fn upsert(&self, config: &AgentConfig) -> Result<(), Error> {
        if take_failure(&self.fail_upserts) {
            return Err(Error::persistence(format!("injected upsert failure for {}", config.id)));
        }
        self.agents.write().await.insert(config.id.clone(), config.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AgentConfig>, Error> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<AgentConfig>, Error> {
        if take_failure(&self.fail_lists) {
            return Err(Error::persistence("injected list failure"));
        }
        let mut agents: Vec<AgentConfig> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(agents)
    }

    async fn remove(&self, id: &str) -> Result<(), Error> {
        if take_failure(&self.fail_removes) {
            return Err(Error::persistence(format!("injected remove failure for {}", id)));
        }
        self.agents.write().await.remove(id);
        Ok(())
    }
}

struct SessionRecord {
    name: Option<String>,
    items: Vec<AgentInputItem>,
    created_at: i64,
    updated_at: i64,
    // Tie-breaker for sessions touched within the same millisecond
    revision: u64,
}

impl SessionRecord {
    fn summary(&self, id: &str) -> SessionSummary {
        SessionSummary {
            id: id.to_string(),
            name: self.name.clone(),
            item_count: self.items.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// In-memory session repository
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    revision: AtomicU64,
    fail_appends: AtomicUsize,
    fail_pops: AtomicUsize,
    appends: AtomicUsize,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with a persistence error.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pops(&self, n: usize) {
        self.fail_pops.store(n, Ordering::SeqCst);
    }

    /// Number of append calls that reached storage (failed ones included).
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, Error> {
        let revision = self.next_revision();
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        let out = f(record);
        record.updated_at = now_millis().max(record.updated_at);
        record.revision = revision;
        Ok(out)
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session_id: &str, name: Option<&str>) -> Result<(), Error> {
        let revision = self.next_revision();
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_insert_with(|| {
            let now = now_millis();
            SessionRecord {
                name: name.map(str::to_string),
                items: Vec::new(),
                created_at: now,
                updated_at: now,
                revision,
            }
        });
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionSummary>, Error> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.summary(session_id)))
    }

    async fn get_items(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AgentInputItem>, Error> {
        let sessions = self.sessions.read().await;
        let Some(record) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |l| record.items.len().saturating_sub(l));
        Ok(record.items[skip..].to_vec())
    }

    async fn append_items(&self, session_id: &str, items: &[AgentInputItem]) -> Result<(), Error> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_appends) {
            return Err(Error::persistence(format!(
                "injected append failure for session {}",
                session_id
            )));
        }
        self.with_session(session_id, |record| record.items.extend_from_slice(items))
            .await
    }

    async fn pop_item(&self, session_id: &str) -> Result<Option<AgentInputItem>, Error> {
        if take_failure(&self.fail_pops) {
            return Err(Error::persistence(format!(
                "injected pop failure for session {}",
                session_id
            )));
        }
        match self.with_session(session_id, |record| record.items.pop()).await {
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }

    async fn clear(&self, session_id: &str) -> Result<(), Error> {
        self.with_session(session_id, |record| record.items.clear())
            .await
    }

    async fn rename(&self, session_id: &str, name: &str) -> Result<(), Error> {
        self.with_session(session_id, |record| record.name = Some(name.to_string()))
            .await
    }

    async fn remove(&self, session_id: &str) -> Result<(), Error> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<SessionSummary>, Error> {
        let sessions = self.sessions.read().await;
        let mut records: Vec<(&String, &SessionRecord)> = sessions.iter().collect();
        records.sort_by(|a, b| {
            b.1.updated_at
                .cmp(&a.1.updated_at)
                .then_with(|| b.1.revision.cmp(&a.1.revision))
        });
        Ok(records
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, r)| r.summary(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::{AgentConfigInput, ModelConfig};

    fn config(name: &str) -> AgentConfig {
        AgentConfig::from_input(AgentConfigInput::new(
            name,
            "be helpful",
            ModelConfig::new("openai-default", "gpt-5"),
        ))
    }

    #[tokio::test]
    async fn test_agent_upsert_is_idempotent() {
        let repo = MemoryAgentRepository::new();
        let mut agent = config("A");
        repo.upsert(&agent).await.unwrap();
        agent.instructions = "changed".into();
        repo.upsert(&agent).await.unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].instructions, "changed");
        assert!(repo.exists(&agent.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_agent_injected_failures_are_consumed() {
        let repo = MemoryAgentRepository::new();
        let agent = config("A");
        repo.fail_next_upserts(1);

        let err = repo.upsert(&agent).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(repo.get(&agent.id).await.unwrap().is_none());

        repo.upsert(&agent).await.unwrap();
        assert_eq!(repo.upsert_count(), 1);
    }

    #[tokio::test]
    async fn test_session_items_in_order_with_limit() {
        let repo = MemorySessionRepository::new();
        repo.create("s1", None).await.unwrap();
        repo.append_items("s1", &[AgentInputItem::user("a"), AgentInputItem::assistant("b")])
            .await
            .unwrap();
        repo.append_items("s1", &[AgentInputItem::user("c")]).await.unwrap();

        let all = repo.get_items("s1", None).await.unwrap();
        assert_eq!(all.len(), 3);
        let last_two = repo.get_items("s1", Some(2)).await.unwrap();
        assert_eq!(last_two, vec![AgentInputItem::assistant("b"), AgentInputItem::user("c")]);

        assert_eq!(repo.pop_item("s1").await.unwrap(), Some(AgentInputItem::user("c")));
        assert_eq!(repo.get("s1").await.unwrap().unwrap().item_count, 2);
    }

    #[tokio::test]
    async fn test_append_to_unknown_session_fails() {
        let repo = MemorySessionRepository::new();
        let err = repo
            .append_items("missing", &[AgentInputItem::user("x")])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(repo.pop_item("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_session_list_most_recent_first() {
        let repo = MemorySessionRepository::new();
        repo.create("old", Some("Old")).await.unwrap();
        repo.create("new", Some("New")).await.unwrap();
        repo.append_items("old", &[AgentInputItem::user("bump")]).await.unwrap();

        let ids: Vec<String> = repo.list(None).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["old", "new"]);
        assert_eq!(repo.list(Some(1)).await.unwrap().len(), 1);
    }
}
