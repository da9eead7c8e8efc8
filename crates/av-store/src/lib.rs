//! av-store: persistence ports for agent-vault
//!
//! Two repositories back the runtime: agent configurations keyed by id, and
//! append-only session logs of [`AgentInputItem`]s. Both come in an in-memory
//! flavor (tests, ephemeral runs) and a SQLite flavor.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use av_core::{AgentConfig, AgentInputItem, Error};

pub use memory::{MemoryAgentRepository, MemorySessionRepository};
pub use sqlite::SqliteStore;

/// Durable storage for agent configurations.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or replace the config keyed by its id.
    async fn upsert(&self, config: &AgentConfig) -> Result<(), Error>;

    async fn get(&self, id: &str) -> Result<Option<AgentConfig>, Error>;

    /// All configs, oldest first.
    async fn list(&self) -> Result<Vec<AgentConfig>, Error>;

    /// Remove a config. Removing an unknown id is not an error.
    async fn remove(&self, id: &str) -> Result<(), Error>;

    async fn exists(&self, id: &str) -> Result<bool, Error> {
        Ok(self.get(id).await?.is_some())
    }
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub item_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Durable storage for session item logs.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Create an empty session row. Creating an existing id is a no-op.
    async fn create(&self, session_id: &str, name: Option<&str>) -> Result<(), Error>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionSummary>, Error>;

    /// Items in append order. With a limit, only the most recent `limit` items.
    async fn get_items(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AgentInputItem>, Error>;

    /// Append items atomically. Fails with NotFound for an unknown session.
    async fn append_items(&self, session_id: &str, items: &[AgentInputItem]) -> Result<(), Error>;

    /// Remove and return the most recent item.
    async fn pop_item(&self, session_id: &str) -> Result<Option<AgentInputItem>, Error>;

    /// Delete every item but keep the session row.
    async fn clear(&self, session_id: &str) -> Result<(), Error>;

    async fn rename(&self, session_id: &str, name: &str) -> Result<(), Error>;

    /// Delete the session and its items. Unknown ids are ignored.
    async fn remove(&self, session_id: &str) -> Result<(), Error>;

    /// Sessions, most recently updated first.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<SessionSummary>, Error>;

    async fn exists(&self, session_id: &str) -> Result<bool, Error> {
        Ok(self.get(session_id).await?.is_some())
    }
}
