//! Embedded SQLite state store.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use super::models::*;
use super::{EventFilter, SessionFilter, StateStore, StoreError, StoreResult};

/// Single-file embedded store (WAL mode, busy timeout).
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a `sqlite://` URL, creating the file if missing.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                sandbox_id TEXT,
                status TEXT NOT NULL,
                runner_id TEXT,
                parent_session_id TEXT,
                model TEXT,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sandboxes (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT,
                agent_name TEXT NOT NULL,
                state TEXT NOT NULL,
                workspace_dir TEXT NOT NULL,
                pid INTEGER,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runners (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                max_sandboxes INTEGER NOT NULL,
                active_count INTEGER NOT NULL DEFAULT 0,
                warming_count INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_at TEXT NOT NULL,
                registered_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, sequence)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_session ON session_events (session_id, sequence)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const SESSION_COLUMNS: &str = "id, tenant_id, agent_name, sandbox_id, status, runner_id, \
                               parent_session_id, model, created_at, last_active_at";
const SANDBOX_COLUMNS: &str =
    "id, tenant_id, session_id, agent_name, state, workspace_dir, pid, created_at, last_used_at";

#[async_trait]
impl StateStore for SqliteStore {
    // -- Agents --

    async fn upsert_agent(&self, tenant_id: &str, name: &str, path: &str) -> StoreResult<Agent> {
        let now = now_rfc3339();
        let agent = sqlx::query_as::<_, Agent>(
            r#"
            INSERT INTO agents (id, tenant_id, name, version, path, created_at, updated_at)
            VALUES (?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT (tenant_id, name) DO UPDATE
                SET version = agents.version + 1,
                    path = excluded.path,
                    updated_at = excluded.updated_at
            RETURNING id, tenant_id, name, version, path, created_at, updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(name)
        .bind(path)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(agent)
    }

    async fn get_agent(&self, tenant_id: &str, name: &str) -> StoreResult<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>(
            "SELECT id, tenant_id, name, version, path, created_at, updated_at \
             FROM agents WHERE tenant_id = ? AND name = ?",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(agent)
    }

    async fn list_agents(&self, tenant_id: &str) -> StoreResult<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(
            "SELECT id, tenant_id, name, version, path, created_at, updated_at \
             FROM agents WHERE tenant_id = ? ORDER BY name",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(agents)
    }

    async fn delete_agent(&self, tenant_id: &str, name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM agents WHERE tenant_id = ? AND name = ?")
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent {}", name)));
        }
        Ok(())
    }

    // -- Sessions --

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, tenant_id, agent_name, sandbox_id, status, runner_id,
                                  parent_session_id, model, created_at, last_active_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.tenant_id)
        .bind(&session.agent_name)
        .bind(&session.sandbox_id)
        .bind(session.status.to_string())
        .bind(&session.runner_id)
        .bind(&session.parent_session_id)
        .bind(&session.model)
        .bind(&session.created_at)
        .bind(&session.last_active_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = ? AND id = ?"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn list_sessions(
        &self,
        tenant_id: &str,
        filter: &SessionFilter,
    ) -> StoreResult<Vec<Session>> {
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = ?");
        if filter.agent.is_some() {
            sql.push_str(" AND agent_name = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, Session>(&sql).bind(tenant_id);
        if let Some(ref agent) = filter.agent {
            query = query.bind(agent.clone());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        let sessions = query
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        Ok(sessions)
    }

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET status = ?, last_active_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_session(&self, id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session_sandbox(&self, id: &str, sandbox_id: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET sandbox_id = ? WHERE id = ?")
            .bind(sandbox_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session_runner(&self, id: &str, runner_id: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET runner_id = ? WHERE id = ?")
            .bind(runner_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fork_session(&self, parent: &Session, child: &Session) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, tenant_id, agent_name, sandbox_id, status, runner_id,
                                  parent_session_id, model, created_at, last_active_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&child.id)
        .bind(&child.tenant_id)
        .bind(&child.agent_name)
        .bind(&child.sandbox_id)
        .bind(child.status.to_string())
        .bind(&child.runner_id)
        .bind(&child.parent_session_id)
        .bind(&child.model)
        .bind(&child.created_at)
        .bind(&child.last_active_at)
        .execute(&mut *tx)
        .await?;

        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, session_id, role, content, sequence, created_at \
             FROM messages WHERE session_id = ? ORDER BY sequence",
        )
        .bind(&parent.id)
        .fetch_all(&mut *tx)
        .await?;

        for message in &messages {
            sqlx::query(
                "INSERT INTO messages (id, session_id, role, content, sequence, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&child.id)
            .bind(message.role.to_string())
            .bind(&message.content)
            .bind(message.sequence)
            .bind(&message.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // -- Sandboxes --

    async fn insert_sandbox(&self, sandbox: &SandboxRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (id, tenant_id, session_id, agent_name, state, workspace_dir,
                                   pid, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
                SET session_id = excluded.session_id,
                    state = excluded.state,
                    workspace_dir = excluded.workspace_dir,
                    pid = excluded.pid,
                    last_used_at = excluded.last_used_at
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.tenant_id)
        .bind(&sandbox.session_id)
        .bind(&sandbox.agent_name)
        .bind(sandbox.state.to_string())
        .bind(&sandbox.workspace_dir)
        .bind(sandbox.pid)
        .bind(&sandbox.created_at)
        .bind(&sandbox.last_used_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_sandbox(&self, id: &str) -> StoreResult<Option<SandboxRecord>> {
        let sandbox = sqlx::query_as::<_, SandboxRecord>(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sandbox)
    }

    async fn list_sandboxes(&self) -> StoreResult<Vec<SandboxRecord>> {
        let sandboxes = sqlx::query_as::<_, SandboxRecord>(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes ORDER BY last_used_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(sandboxes)
    }

    async fn list_sandboxes_by_state(
        &self,
        state: SandboxState,
    ) -> StoreResult<Vec<SandboxRecord>> {
        let sandboxes = sqlx::query_as::<_, SandboxRecord>(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = ? ORDER BY last_used_at"
        ))
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(sandboxes)
    }

    async fn set_sandbox_state(&self, id: &str, state: SandboxState) -> StoreResult<()> {
        sqlx::query("UPDATE sandboxes SET state = ?, last_used_at = ? WHERE id = ?")
            .bind(state.to_string())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_sandbox_pid(&self, id: &str, pid: Option<i64>) -> StoreResult<()> {
        sqlx::query("UPDATE sandboxes SET pid = ? WHERE id = ?")
            .bind(pid)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_sandbox(&self, id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sandboxes SET last_used_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale_cold_sandboxes(&self, cutoff: &str) -> StoreResult<Vec<SandboxRecord>> {
        let sandboxes = sqlx::query_as::<_, SandboxRecord>(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = 'cold' AND last_used_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(sandboxes)
    }

    async fn delete_sandbox(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Messages --

    async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> StoreResult<Message> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (id, session_id, role, content, sequence, created_at)
            VALUES (?, ?, ?, ?,
                    (SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?),
                    ?)
            RETURNING id, session_id, role, content, sequence, created_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(role.to_string())
        .bind(content)
        .bind(session_id)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    async fn list_messages(
        &self,
        session_id: &str,
        after_sequence: Option<i64>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, session_id, role, content, sequence, created_at \
             FROM messages WHERE session_id = ? AND sequence > ? \
             ORDER BY sequence LIMIT ?",
        )
        .bind(session_id)
        .bind(after_sequence.unwrap_or(0))
        .bind(limit.unwrap_or(1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    // -- Timeline events --

    async fn append_event(
        &self,
        session_id: &str,
        event_type: EventType,
        data: &str,
    ) -> StoreResult<SessionEvent> {
        let event = sqlx::query_as::<_, SessionEvent>(
            r#"
            INSERT INTO session_events (id, session_id, event_type, data, sequence, created_at)
            VALUES (?, ?, ?, ?,
                    (SELECT COALESCE(MAX(sequence), 0) + 1
                     FROM session_events WHERE session_id = ?),
                    ?)
            RETURNING id, session_id, event_type, data, sequence, created_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(event_type.to_string())
        .bind(data)
        .bind(session_id)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    async fn list_events(
        &self,
        session_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<SessionEvent>> {
        let mut sql = String::from(
            "SELECT id, session_id, event_type, data, sequence, created_at \
             FROM session_events WHERE session_id = ? AND sequence > ?",
        );
        if filter.event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        sql.push_str(" ORDER BY sequence LIMIT ?");

        let mut query = sqlx::query_as::<_, SessionEvent>(&sql)
            .bind(session_id)
            .bind(filter.after_sequence.unwrap_or(0));
        if let Some(ty) = filter.event_type {
            query = query.bind(ty.to_string());
        }
        let events = query
            .bind(filter.limit.unwrap_or(1000))
            .fetch_all(&self.pool)
            .await?;

        Ok(events)
    }

    // -- Runners --

    async fn upsert_runner(&self, runner: &Runner) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runners (id, host, port, max_sandboxes, active_count, warming_count,
                                 last_heartbeat_at, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
                SET host = excluded.host,
                    port = excluded.port,
                    max_sandboxes = excluded.max_sandboxes,
                    last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(&runner.id)
        .bind(&runner.host)
        .bind(runner.port)
        .bind(runner.max_sandboxes)
        .bind(runner.active_count)
        .bind(runner.warming_count)
        .bind(&runner.last_heartbeat_at)
        .bind(&runner.registered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn heartbeat_runner(
        &self,
        id: &str,
        active_count: i64,
        warming_count: i64,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE runners SET last_heartbeat_at = ?, active_count = ?, warming_count = ? \
             WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(active_count)
        .bind(warming_count)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("runner {}", id)));
        }
        Ok(())
    }

    async fn get_runner(&self, id: &str) -> StoreResult<Option<Runner>> {
        let runner = sqlx::query_as::<_, Runner>(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, \
                    last_heartbeat_at, registered_at \
             FROM runners WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(runner)
    }

    async fn list_runners(&self) -> StoreResult<Vec<Runner>> {
        let runners = sqlx::query_as::<_, Runner>(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, \
                    last_heartbeat_at, registered_at \
             FROM runners ORDER BY registered_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(runners)
    }

    // -- API keys --

    async fn upsert_api_key(&self, key: &ApiKey) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, tenant_id, key_hash, label, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (key_hash) DO UPDATE SET label = excluded.label
            "#,
        )
        .bind(&key.id)
        .bind(&key.tenant_id)
        .bind(&key.key_hash)
        .bind(&key.label)
        .bind(&key.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, tenant_id, key_hash, label, created_at FROM api_keys WHERE key_hash = ?",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    fn session(id: &str, agent: &str) -> Session {
        Session {
            id: id.to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            agent_name: agent.to_string(),
            sandbox_id: None,
            status: SessionStatus::Starting,
            runner_id: None,
            parent_session_id: None,
            model: None,
            created_at: now_rfc3339(),
            last_active_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_agent_upsert_bumps_version() {
        let store = store().await;

        let first = store
            .upsert_agent(DEFAULT_TENANT, "qa-bot", "/data/agents/qa-bot")
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let second = store
            .upsert_agent(DEFAULT_TENANT, "qa-bot", "/data/agents/qa-bot")
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.id, first.id);

        // Different tenant, same name: independent row.
        let other = store
            .upsert_agent("acme", "qa-bot", "/data/agents/qa-bot")
            .await
            .unwrap();
        assert_eq!(other.version, 1);
    }

    #[tokio::test]
    async fn test_agent_delete() {
        let store = store().await;
        store
            .upsert_agent(DEFAULT_TENANT, "bot", "/p")
            .await
            .unwrap();
        store.delete_agent(DEFAULT_TENANT, "bot").await.unwrap();
        assert!(store
            .get_agent(DEFAULT_TENANT, "bot")
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.delete_agent(DEFAULT_TENANT, "bot").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_message_sequences_are_strictly_increasing() {
        let store = store().await;
        store.insert_session(&session("s1", "bot")).await.unwrap();

        let mut last = 0;
        for i in 0..5 {
            let msg = store
                .append_message("s1", MessageRole::User, &format!("m{}", i))
                .await
                .unwrap();
            assert!(msg.sequence > last);
            last = msg.sequence;
        }

        // Separate counter per session.
        store.insert_session(&session("s2", "bot")).await.unwrap();
        let msg = store
            .append_message("s2", MessageRole::User, "first")
            .await
            .unwrap();
        assert_eq!(msg.sequence, 1);
    }

    #[tokio::test]
    async fn test_event_counter_independent_of_messages() {
        let store = store().await;
        store.insert_session(&session("s1", "bot")).await.unwrap();

        store
            .append_message("s1", MessageRole::User, "hi")
            .await
            .unwrap();
        let ev = store
            .append_event("s1", EventType::Lifecycle, r#"{"op":"created"}"#)
            .await
            .unwrap();
        assert_eq!(ev.sequence, 1);

        let ev2 = store
            .append_event("s1", EventType::Text, r#"{"text":"hello"}"#)
            .await
            .unwrap();
        assert_eq!(ev2.sequence, 2);
    }

    #[tokio::test]
    async fn test_list_messages_after_cursor() {
        let store = store().await;
        store.insert_session(&session("s1", "bot")).await.unwrap();
        for i in 0..4 {
            store
                .append_message("s1", MessageRole::User, &format!("m{}", i))
                .await
                .unwrap();
        }

        let tail = store.list_messages("s1", Some(2), None).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 3);
        assert_eq!(tail[1].sequence, 4);
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let store = store().await;
        store.insert_session(&session("s1", "bot")).await.unwrap();
        store
            .append_event("s1", EventType::Text, r#"{"text":"a"}"#)
            .await
            .unwrap();
        store
            .append_event("s1", EventType::ToolStart, r#"{"name":"Read"}"#)
            .await
            .unwrap();

        let filter = EventFilter {
            event_type: Some(EventType::ToolStart),
            ..Default::default()
        };
        let events = store.list_events("s1", &filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ToolStart);
    }

    #[tokio::test]
    async fn test_fork_copies_messages() {
        let store = store().await;
        let parent = session("parent", "bot");
        store.insert_session(&parent).await.unwrap();
        store
            .append_message("parent", MessageRole::User, "hello")
            .await
            .unwrap();
        store
            .append_message("parent", MessageRole::Assistant, "world")
            .await
            .unwrap();

        let mut child = session("child", "bot");
        child.parent_session_id = Some("parent".to_string());
        store.fork_session(&parent, &child).await.unwrap();

        let copied = store.list_messages("child", None, None).await.unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(copied[0].content, "hello");
        assert_eq!(copied[1].sequence, 2);
        // Fresh ids, same ordering.
        let originals = store.list_messages("parent", None, None).await.unwrap();
        assert_ne!(copied[0].id, originals[0].id);
    }

    #[tokio::test]
    async fn test_session_filters() {
        let store = store().await;
        store.insert_session(&session("a1", "alpha")).await.unwrap();
        store.insert_session(&session("b1", "beta")).await.unwrap();
        store
            .update_session_status("b1", SessionStatus::Active)
            .await
            .unwrap();

        let by_agent = store
            .list_sessions(
                DEFAULT_TENANT,
                &SessionFilter {
                    agent: Some("alpha".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].id, "a1");

        let by_status = store
            .list_sessions(
                DEFAULT_TENANT,
                &SessionFilter {
                    status: Some(SessionStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id, "b1");
    }

    #[tokio::test]
    async fn test_sandbox_state_and_stale_listing() {
        let store = store().await;
        let sandbox = SandboxRecord {
            id: "s1".to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            session_id: Some("s1".to_string()),
            agent_name: "bot".to_string(),
            state: SandboxState::Warming,
            workspace_dir: "/data/sandboxes/s1".to_string(),
            pid: Some(4242),
            created_at: now_rfc3339(),
            last_used_at: now_rfc3339(),
        };
        store.insert_sandbox(&sandbox).await.unwrap();

        store
            .set_sandbox_state("s1", SandboxState::Cold)
            .await
            .unwrap();
        let got = store.get_sandbox("s1").await.unwrap().unwrap();
        assert_eq!(got.state, SandboxState::Cold);

        // Not stale yet: last_used_at was just refreshed by the update.
        let cutoff = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        assert!(store
            .list_stale_cold_sandboxes(&cutoff)
            .await
            .unwrap()
            .is_empty());

        // With a future cutoff everything cold is stale.
        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        assert_eq!(store.list_stale_cold_sandboxes(&future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runner_heartbeat() {
        let store = store().await;
        let runner = Runner {
            id: "r1".to_string(),
            host: "10.0.0.2".to_string(),
            port: 4101,
            max_sandboxes: 4,
            active_count: 0,
            warming_count: 0,
            last_heartbeat_at: now_rfc3339(),
            registered_at: now_rfc3339(),
        };
        store.upsert_runner(&runner).await.unwrap();
        store.heartbeat_runner("r1", 2, 1).await.unwrap();

        let got = store.get_runner("r1").await.unwrap().unwrap();
        assert_eq!(got.active_count, 2);
        assert_eq!(got.warming_count, 1);

        assert!(matches!(
            store.heartbeat_runner("ghost", 0, 0).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_lookup() {
        let store = store().await;
        let key = ApiKey {
            id: "k1".to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            key_hash: "abc123".to_string(),
            label: "primary".to_string(),
            created_at: now_rfc3339(),
        };
        store.upsert_api_key(&key).await.unwrap();

        let found = store.find_api_key_by_hash("abc123").await.unwrap();
        assert_eq!(found.unwrap().label, "primary");
        assert!(store.find_api_key_by_hash("nope").await.unwrap().is_none());
    }
}
