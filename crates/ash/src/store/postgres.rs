//! Networked Postgres state store.
//!
//! Mirrors the SQLite backend; only placeholders and DDL differ. Timestamps
//! are the same RFC 3339 TEXT values, so rows are portable between the two.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::models::*;
use super::{EventFilter, SessionFilter, StateStore, StoreError, StoreResult};

/// Networked relational store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to a `postgres://` URL.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version BIGINT NOT NULL,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, name)
            )
            "#,
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
            r#"
            CREATE TABLE IF NOT EXISTS sandboxes (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT,
                agent_name TEXT NOT NULL,
                state TEXT NOT NULL,
                workspace_dir TEXT NOT NULL,
                pid BIGINT,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, sequence)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS session_events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, sequence)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runners (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port BIGINT NOT NULL,
                max_sandboxes BIGINT NOT NULL,
                active_count BIGINT NOT NULL DEFAULT 0,
                warming_count BIGINT NOT NULL DEFAULT 0,
                last_heartbeat_at TEXT NOT NULL,
                registered_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, sequence)",
            "CREATE INDEX IF NOT EXISTS idx_events_session \
             ON session_events (session_id, sequence)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }
}

const SESSION_COLUMNS: &str = "id, tenant_id, agent_name, sandbox_id, status, runner_id, \
                               parent_session_id, model, created_at, last_active_at";
const SANDBOX_COLUMNS: &str =
    "id, tenant_id, session_id, agent_name, state, workspace_dir, pid, created_at, last_used_at";

#[async_trait]
impl StateStore for PostgresStore {
    // -- Agents --

    async fn upsert_agent(&self, tenant_id: &str, name: &str, path: &str) -> StoreResult<Agent> {
        let now = now_rfc3339();
        let agent = sqlx::query_as::<_, Agent>(
            r#"
            INSERT INTO agents (id, tenant_id, name, version, path, created_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, $5, $5)
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
        .fetch_one(&self.pool)
        .await?;

        Ok(agent)
    }

    async fn get_agent(&self, tenant_id: &str, name: &str) -> StoreResult<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>(
            "SELECT id, tenant_id, name, version, path, created_at, updated_at \
             FROM agents WHERE tenant_id = $1 AND name = $2",
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
             FROM agents WHERE tenant_id = $1 ORDER BY name",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(agents)
    }

    async fn delete_agent(&self, tenant_id: &str, name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM agents WHERE tenant_id = $1 AND name = $2")
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = $1 AND id = $2"
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
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = $1");
        let mut next_param = 2;
        if filter.agent.is_some() {
            sql.push_str(&format!(" AND agent_name = ${}", next_param));
            next_param += 1;
        }
        if filter.status.is_some() {
            sql.push_str(&format!(" AND status = ${}", next_param));
            next_param += 1;
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            next_param,
            next_param + 1
        ));

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
        sqlx::query("UPDATE sessions SET status = $1, last_active_at = $2 WHERE id = $3")
            .bind(status.to_string())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_session(&self, id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET last_active_at = $1 WHERE id = $2")
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session_sandbox(&self, id: &str, sandbox_id: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET sandbox_id = $1 WHERE id = $2")
            .bind(sandbox_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session_runner(&self, id: &str, runner_id: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET runner_id = $1 WHERE id = $2")
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
             FROM messages WHERE session_id = $1 ORDER BY sequence",
        )
        .bind(&parent.id)
        .fetch_all(&mut *tx)
        .await?;

        for message in &messages {
            sqlx::query(
                "INSERT INTO messages (id, session_id, role, content, sequence, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = $1"
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
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = $1 ORDER BY last_used_at"
        ))
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(sandboxes)
    }

    async fn set_sandbox_state(&self, id: &str, state: SandboxState) -> StoreResult<()> {
        sqlx::query("UPDATE sandboxes SET state = $1, last_used_at = $2 WHERE id = $3")
            .bind(state.to_string())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_sandbox_pid(&self, id: &str, pid: Option<i64>) -> StoreResult<()> {
        sqlx::query("UPDATE sandboxes SET pid = $1 WHERE id = $2")
            .bind(pid)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_sandbox(&self, id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sandboxes SET last_used_at = $1 WHERE id = $2")
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale_cold_sandboxes(&self, cutoff: &str) -> StoreResult<Vec<SandboxRecord>> {
        let sandboxes = sqlx::query_as::<_, SandboxRecord>(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = 'cold' AND last_used_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(sandboxes)
    }

    async fn delete_sandbox(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = $1")
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
            VALUES ($1, $2, $3, $4,
                    (SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = $2),
                    $5)
            RETURNING id, session_id, role, content, sequence, created_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(role.to_string())
        .bind(content)
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
             FROM messages WHERE session_id = $1 AND sequence > $2 \
             ORDER BY sequence LIMIT $3",
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
            VALUES ($1, $2, $3, $4,
                    (SELECT COALESCE(MAX(sequence), 0) + 1
                     FROM session_events WHERE session_id = $2),
                    $5)
            RETURNING id, session_id, event_type, data, sequence, created_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(event_type.to_string())
        .bind(data)
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
             FROM session_events WHERE session_id = $1 AND sequence > $2",
        );
        let mut next_param = 3;
        if filter.event_type.is_some() {
            sql.push_str(&format!(" AND event_type = ${}", next_param));
            next_param += 1;
        }
        sql.push_str(&format!(" ORDER BY sequence LIMIT ${}", next_param));

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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
            "UPDATE runners SET last_heartbeat_at = $1, active_count = $2, warming_count = $3 \
             WHERE id = $4",
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
             FROM runners WHERE id = $1",
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
            VALUES ($1, $2, $3, $4, $5)
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
            "SELECT id, tenant_id, key_hash, label, created_at FROM api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }
}
