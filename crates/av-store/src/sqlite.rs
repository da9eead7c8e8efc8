//! SQLite-backed repositories.
//!
//! Agents are stored one row per config with JSON blobs for the list-valued
//! fields. Session items are stored one row each, ordered by an
//! autoincrementing sequence number.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use av_core::definition::now_millis;
use av_core::{AgentConfig, AgentInputItem, Error, ModelConfig};

use crate::{AgentRepository, SessionRepository, SessionSummary};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    instructions TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    model_settings TEXT,
    tools TEXT NOT NULL,
    handoff_ids TEXT NOT NULL,
    output_type TEXT,
    input_guardrails TEXT NOT NULL,
    output_guardrails TEXT NOT NULL,
    mcp_servers TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    item TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_items_session ON session_items(session_id, seq);
";

fn db_err(e: rusqlite::Error) -> Error {
    Error::persistence(e.to_string())
}

/// Agent and session storage in a single SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = db_path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::persistence(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| Error::persistence(format!("Failed to open database: {}", e)))?;
        debug!(path = %path.display(), "Opened database");
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().map_err(|e| {
            Error::persistence(format!("Failed to create in-memory database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::persistence(format!("Failed to create tables: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Error> {
        self.conn
            .lock()
            .map_err(|_| Error::persistence("database connection lock poisoned"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, Error> {
    Ok(serde_json::from_str(text)?)
}

/// Raw column values of an agent row, decoded after the statement finishes.
struct AgentRow {
    id: String,
    name: String,
    instructions: String,
    provider: String,
    model: String,
    model_settings: Option<String>,
    tools: String,
    handoff_ids: String,
    output_type: Option<String>,
    input_guardrails: String,
    output_guardrails: String,
    mcp_servers: String,
    created_at: i64,
    updated_at: i64,
}

const AGENT_COLUMNS: &str = "id, name, instructions, provider, model, model_settings, tools, \
     handoff_ids, output_type, input_guardrails, output_guardrails, mcp_servers, created_at, updated_at";

impl AgentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            instructions: row.get(2)?,
            provider: row.get(3)?,
            model: row.get(4)?,
            model_settings: row.get(5)?,
            tools: row.get(6)?,
            handoff_ids: row.get(7)?,
            output_type: row.get(8)?,
            input_guardrails: row.get(9)?,
            output_guardrails: row.get(10)?,
            mcp_servers: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn decode(self) -> Result<AgentConfig, Error> {
        Ok(AgentConfig {
            id: self.id,
            name: self.name,
            instructions: self.instructions,
            model_config: ModelConfig {
                provider: self.provider,
                model: self.model,
                settings: self.model_settings.as_deref().map(from_json).transpose()?,
            },
            tools: from_json(&self.tools)?,
            handoff_ids: from_json(&self.handoff_ids)?,
            output_type: self.output_type.as_deref().map(from_json).transpose()?,
            input_guardrails: from_json(&self.input_guardrails)?,
            output_guardrails: from_json(&self.output_guardrails)?,
            mcp_servers: from_json(&self.mcp_servers)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl AgentRepository for SqliteStore {
    async fn upsert(&self, config: &AgentConfig) -> Result<(), Error> {
        let settings = config.model_config.settings.as_ref().map(to_json).transpose()?;
        let output_type = config.output_type.as_ref().map(to_json).transpose()?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                AGENT_COLUMNS
            ),
            params![
                config.id,
                config.name,
                config.instructions,
                config.model_config.provider,
                config.model_config.model,
                settings,
                to_json(&config.tools)?,
                to_json(&config.handoff_ids)?,
                output_type,
                to_json(&config.input_guardrails)?,
                to_json(&config.output_guardrails)?,
                to_json(&config.mcp_servers)?,
                config.created_at,
                config.updated_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AgentConfig>, Error> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                params![id],
                AgentRow::read,
            )
            .optional()
            .map_err(db_err)?
        };
        row.map(AgentRow::decode).transpose()
    }

    async fn list(&self) -> Result<Vec<AgentConfig>, Error> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM agents ORDER BY created_at, id",
                    AGENT_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], AgentRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows
        };
        rows.into_iter().map(AgentRow::decode).collect()
    }

    async fn remove(&self, id: &str) -> Result<(), Error> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM agents WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(())
    }
}

fn session_exists(conn: &Connection, session_id: &str) -> Result<bool, Error> {
    conn.query_row(
        "SELECT 1 FROM sessions WHERE id = ?1",
        params![session_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(db_err)
}

fn touch_session(conn: &Connection, session_id: &str) -> Result<usize, Error> {
    conn.execute(
        "UPDATE sessions SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
        params![session_id, now_millis()],
    )
    .map_err(db_err)
}

fn read_summary(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        item_count: row.get::<_, i64>(4)?.max(0) as usize,
    })
}

const SUMMARY_SELECT: &str = "SELECT s.id, s.name, s.created_at, s.updated_at, \
     (SELECT COUNT(*) FROM session_items i WHERE i.session_id = s.id) FROM sessions s";

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn create(&self, session_id: &str, name: Option<&str>) -> Result<(), Error> {
        let now = now_millis();
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![session_id, name, now],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionSummary>, Error> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE s.id = ?1", SUMMARY_SELECT),
            params![session_id],
            read_summary,
        )
        .optional()
        .map_err(db_err)
    }

    async fn get_items(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AgentInputItem>, Error> {
        // LIMIT -1 means no limit in SQLite
        let limit = limit.map_or(-1, |l| l as i64);
        let raw = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT item FROM (
                        SELECT seq, item FROM session_items WHERE session_id = ?1
                        ORDER BY seq DESC LIMIT ?2
                    ) ORDER BY seq ASC",
                )
                .map_err(db_err)?;
            let raw = stmt
                .query_map(params![session_id, limit], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            raw
        };
        raw.iter().map(|text| from_json(text)).collect()
    }

    async fn append_items(&self, session_id: &str, items: &[AgentInputItem]) -> Result<(), Error> {
        let encoded = items.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
        let now = now_millis();

        let mut conn = self.conn()?;
        if !session_exists(&conn, session_id)? {
            return Err(Error::not_found("session", session_id));
        }
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO session_items (session_id, item, created_at) VALUES (?1, ?2, ?3)",
                )
                .map_err(db_err)?;
            for item in &encoded {
                stmt.execute(params![session_id, item, now]).map_err(db_err)?;
            }
        }
        touch_session(&tx, session_id)?;
        tx.commit().map_err(db_err)?;
        debug!(session = %session_id, count = items.len(), "Appended session items");
        Ok(())
    }

    async fn pop_item(&self, session_id: &str) -> Result<Option<AgentInputItem>, Error> {
        let popped = {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(db_err)?;
            let last: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, item FROM session_items WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            if let Some((seq, _)) = &last {
                tx.execute("DELETE FROM session_items WHERE seq = ?1", params![seq])
                    .map_err(db_err)?;
                touch_session(&tx, session_id)?;
            }
            tx.commit().map_err(db_err)?;
            last
        };
        popped.map(|(_, text)| from_json(&text)).transpose()
    }

    async fn clear(&self, session_id: &str) -> Result<(), Error> {
        let conn = self.conn()?;
        if !session_exists(&conn, session_id)? {
            return Err(Error::not_found("session", session_id));
        }
        conn.execute("DELETE FROM session_items WHERE session_id = ?1", params![session_id])
            .map_err(db_err)?;
        touch_session(&conn, session_id)?;
        Ok(())
    }

    async fn rename(&self, session_id: &str, name: &str) -> Result<(), Error> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE sessions SET name = ?2, updated_at = MAX(updated_at, ?3) WHERE id = ?1",
                params![session_id, name, now_millis()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::not_found("session", session_id));
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), Error> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<SessionSummary>, Error> {
        let limit = limit.map_or(-1, |l| l as i64);
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{} ORDER BY s.updated_at DESC, s.rowid DESC LIMIT ?1",
                SUMMARY_SELECT
            ))
            .map_err(db_err)?;
        let summaries = stmt
            .query_map(params![limit], read_summary)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::{
        AgentConfigInput, FunctionToolConfig, GuardrailConfig, HostedToolConfig, ModelSettings,
        ToolConfig,
    };
    use serde_json::json;

    fn sample_agent() -> AgentConfig {
        let mut model = ModelConfig::new("openai-default", "gpt-5");
        model.settings = Some(ModelSettings {
            temperature: Some(0.5),
            ..Default::default()
        });
        let mut input = AgentConfigInput::new("Writer", "Write notes", model)
            .with_tool(ToolConfig::Function(FunctionToolConfig::new("echo")))
            .with_tool(ToolConfig::Hosted(HostedToolConfig {
                name: "web_search".into(),
                provider_data: json!({}),
                enabled: false,
            }))
            .with_handoff("other-agent");
        input.output_type = Some(json!({"type": "object"}));
        input.input_guardrails.push(GuardrailConfig {
            name: "no-secrets".into(),
            config: json!({"level": 1}),
        });
        AgentConfig::from_input(input)
    }

    #[tokio::test]
    async fn test_agent_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let agent = sample_agent();
        store.upsert(&agent).await.unwrap();

        let loaded = AgentRepository::get(&store, &agent.id).await.unwrap().unwrap();
        assert_eq!(loaded, agent);
        assert!(AgentRepository::exists(&store, &agent.id).await.unwrap());

        AgentRepository::remove(&store, &agent.id).await.unwrap();
        assert!(AgentRepository::list(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_log_operations() {
        let store = SqliteStore::in_memory().unwrap();
        store.create("s1", Some("First")).await.unwrap();
        store.create("s1", Some("Ignored")).await.unwrap();

        store
            .append_items("s1", &[AgentInputItem::user("hi"), AgentInputItem::assistant("hello")])
            .await
            .unwrap();
        store.append_items("s1", &[AgentInputItem::user("more")]).await.unwrap();

        let items = store.get_items("s1", Some(2)).await.unwrap();
        assert_eq!(items, vec![AgentInputItem::assistant("hello"), AgentInputItem::user("more")]);

        let popped = store.pop_item("s1").await.unwrap();
        assert_eq!(popped, Some(AgentInputItem::user("more")));

        let summary = SessionRepository::get(&store, "s1").await.unwrap().unwrap();
        assert_eq!(summary.name.as_deref(), Some("First"));
        assert_eq!(summary.item_count, 2);

        store.clear("s1").await.unwrap();
        assert!(store.get_items("s1", None).await.unwrap().is_empty());
        assert!(SessionRepository::exists(&store, "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_session_cascades_items() {
        let store = SqliteStore::in_memory().unwrap();
        store.create("s1", None).await.unwrap();
        store.append_items("s1", &[AgentInputItem::user("x")]).await.unwrap();

        SessionRepository::remove(&store, "s1").await.unwrap();
        assert!(store.get_items("s1", None).await.unwrap().is_empty());
        assert!(SessionRepository::list(&store, None).await.unwrap().is_empty());

        let err = store.append_items("s1", &[AgentInputItem::user("y")]).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
