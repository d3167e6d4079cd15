//! Postgres-backed session/result/api-key store.
//!
//! Connections are taken from a deadpool pool per operation; nothing is held
//! across jobs. The schema bootstrap is idempotent and safe to run
//! concurrently. Callers on the job path treat every method as best-effort:
//! the platform keeps serving from status files when the database is down.

use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Runtime};
use sha2::{Digest, Sha256};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::debug;
use uuid::Uuid;

use crate::config::DatabaseConfig;

use super::error::{Result, StateError};
use super::models::{ApiKeyRecord, ProjectCount, ResultRow, Session, SessionFilter, SessionStatus};

const SCHEMA_SQL: &str = "
create table if not exists test_sessions (
  id uuid primary key,
  project text,
  kind text,
  test_type text,
  status text,
  payload jsonb,
  created_at timestamptz default now(),
  updated_at timestamptz default now()
);
create table if not exists test_results (
  id bigserial primary key,
  session_id uuid references test_sessions(id) on delete cascade,
  summary jsonb,
  created_at timestamptz default now()
);
create table if not exists api_keys (
  id bigserial primary key,
  name text,
  project text,
  key_hash text not null,
  rate_limit_per_min int default 60,
  active boolean default true,
  created_at timestamptz default now()
);
create index if not exists idx_api_keys_hash on api_keys(key_hash);
";

const TERMINAL_STATUSES: &str = "('completed','failed','canceled')";

/// Durable store for sessions, results and API keys
#[derive(Clone)]
pub struct StateStore {
    pool: Pool,
}

impl StateStore {
    /// Build the pool. No connection is attempted here; the first operation
    /// (or `ping`) reveals availability.
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = config.password.clone();
        cfg.dbname = Some(config.dbname.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StateError::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Pool(e.to_string()))
    }

    /// Lightweight availability probe for /healthz
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.simple_query("select 1").await?;
        Ok(())
    }

    /// Create tables and indexes. Running this N times yields the same schema.
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.batch_execute(SCHEMA_SQL).await?;
        debug!("schema bootstrap complete");
        Ok(())
    }

    // ==================== Sessions ====================

    pub async fn upsert_session(
        &self,
        id: Uuid,
        kind: &str,
        test_type: &str,
        project: Option<&str>,
        status: SessionStatus,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "insert into test_sessions(id, project, kind, test_type, status, payload) \
             values ($1,$2,$3,$4,$5,$6) \
             on conflict (id) do update set status=excluded.status, updated_at=now()",
            &[
                &id,
                &project,
                &kind,
                &test_type,
                &status.as_str(),
                payload,
            ],
        )
        .await?;
        Ok(())
    }

    /// Transition a session's status. Terminal rows are left untouched so the
    /// state machine never regresses on redelivered jobs.
    pub async fn update_session_status(&self, id: Uuid, status: SessionStatus) -> Result<()> {
        let conn = self.conn().await?;
        let sql = format!(
            "update test_sessions set status=$1, updated_at=now() \
             where id=$2 and status not in {TERMINAL_STATUSES}"
        );
        conn.execute(sql.as_str(), &[&status.as_str(), &id]).await?;
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "select id, project, kind, test_type, status, created_at, updated_at, payload \
                 from test_sessions where id=$1",
                &[&id],
            )
            .await?;
        row.map(row_to_session).transpose()
    }

    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let mut sql = String::from(
            "select id, project, kind, test_type, status, created_at, updated_at, payload \
             from test_sessions",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(project) = &filter.project {
            params.push(project);
            clauses.push(format!("project = ${}", params.len()));
        }
        if let Some(kind) = &filter.kind {
            params.push(kind);
            clauses.push(format!("kind = ${}", params.len()));
        }
        if let Some(status) = &filter.status {
            params.push(status);
            clauses.push(format!("status = ${}", params.len()));
        }
        if let Some(test_type) = &filter.test_type {
            params.push(test_type);
            clauses.push(format!("test_type = ${}", params.len()));
        }
        if let Some(since) = &filter.since {
            params.push(since);
            clauses.push(format!("created_at >= ${}", params.len()));
        }
        if let Some(until) = &filter.until {
            params.push(until);
            clauses.push(format!("created_at <= ${}", params.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&clauses.join(" and "));
        }
        params.push(&limit);
        sql.push_str(&format!(" order by created_at desc limit ${}", params.len()));
        params.push(&offset);
        sql.push_str(&format!(" offset ${}", params.len()));

        let conn = self.conn().await?;
        let rows = conn.query(sql.as_str(), &params).await?;
        rows.into_iter().map(row_to_session).collect()
    }

    // ==================== Results ====================

    pub async fn append_result(&self, session_id: Uuid, summary: &serde_json::Value) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "insert into test_results(session_id, summary) values ($1,$2)",
            &[&session_id, summary],
        )
        .await?;
        Ok(())
    }

    pub async fn latest_result(&self, session_id: Uuid) -> Result<Option<ResultRow>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "select id, session_id, created_at, summary from test_results \
                 where session_id=$1 order by created_at desc, id desc limit 1",
                &[&session_id],
            )
            .await?;
        Ok(row.map(row_to_result))
    }

    pub async fn list_results(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ResultRow>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "select id, session_id, created_at, summary from test_results \
                 where session_id=$1 order by created_at desc, id desc limit $2 offset $3",
                &[&session_id, &limit, &offset],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_result).collect())
    }

    pub async fn get_result(&self, result_id: i64) -> Result<Option<ResultRow>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "select id, session_id, created_at, summary from test_results where id=$1",
                &[&result_id],
            )
            .await?;
        Ok(row.map(row_to_result))
    }

    // ==================== API keys ====================

    pub async fn insert_api_key(
        &self,
        name: &str,
        project: Option<&str>,
        raw_key: &str,
        rate_limit_per_min: i32,
    ) -> Result<ApiKeyRecord> {
        let key_hash = hash_key(raw_key);
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "insert into api_keys(name, project, key_hash, rate_limit_per_min, active) \
                 values ($1,$2,$3,$4,true) \
                 returning id, name, project, rate_limit_per_min, active, created_at",
                &[&name, &project, &key_hash, &rate_limit_per_min],
            )
            .await?;
        Ok(row_to_api_key(row))
    }

    /// Resolve a raw key to its active record, or None. Only the SHA-256 hash
    /// ever touches the database.
    pub async fn verify_api_key(&self, raw_key: &str) -> Result<Option<ApiKeyRecord>> {
        if raw_key.is_empty() {
            return Ok(None);
        }
        let key_hash = hash_key(raw_key);
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "select id, name, project, rate_limit_per_min, active, created_at \
                 from api_keys where key_hash=$1",
                &[&key_hash],
            )
            .await?;
        Ok(row.map(row_to_api_key).filter(|rec| rec.active))
    }

    pub async fn list_api_keys(&self, limit: i64) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "select id, name, project, rate_limit_per_min, active, created_at \
                 from api_keys order by id desc limit $1",
                &[&limit],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_api_key).collect())
    }

    pub async fn update_api_key(
        &self,
        key_id: i64,
        active: Option<bool>,
        rate_limit_per_min: Option<i32>,
    ) -> Result<Option<ApiKeyRecord>> {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(active) = &active {
            params.push(active);
            sets.push(format!("active=${}", params.len()));
        }
        if let Some(rate) = &rate_limit_per_min {
            params.push(rate);
            sets.push(format!("rate_limit_per_min=${}", params.len()));
        }
        if sets.is_empty() {
            return Ok(None);
        }
        params.push(&key_id);
        let sql = format!(
            "update api_keys set {} where id=${} \
             returning id, name, project, rate_limit_per_min, active, created_at",
            sets.join(", "),
            params.len()
        );

        let conn = self.conn().await?;
        let row = conn.query_opt(sql.as_str(), &params).await?;
        Ok(row.map(row_to_api_key))
    }

    // ==================== Projects ====================

    pub async fn list_projects(&self) -> Result<Vec<ProjectCount>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "select project, count(*) as sessions from test_sessions \
                 group by project order by sessions desc nulls last",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ProjectCount {
                project: row.get("project"),
                sessions: row.get("sessions"),
            })
            .collect())
    }
}

fn row_to_session(row: tokio_postgres::Row) -> Result<Session> {
    let status: String = row.get("status");
    let status = status
        .parse::<SessionStatus>()
        .map_err(|_| StateError::BadRow(format!("unknown session status: {status}")))?;
    Ok(Session {
        id: row.get("id"),
        project: row.get("project"),
        kind: row.get("kind"),
        test_type: row.get("test_type"),
        status,
        created_at: row.get::<_, DateTime<Utc>>("created_at"),
        updated_at: row.get::<_, DateTime<Utc>>("updated_at"),
        payload: row.get("payload"),
    })
}

fn row_to_result(row: tokio_postgres::Row) -> ResultRow {
    ResultRow {
        id: row.get("id"),
        session_id: row.get("session_id"),
        created_at: row.get("created_at"),
        summary: row.get("summary"),
    }
}

fn row_to_api_key(row: tokio_postgres::Row) -> ApiKeyRecord {
    ApiKeyRecord {
        id: row.get("id"),
        name: row.get("name"),
        project: row.get("project"),
        rate_limit_per_min: row.get("rate_limit_per_min"),
        active: row.get("active"),
        created_at: row.get("created_at"),
    }
}

/// Hex-encoded SHA-256 of a raw API key
pub fn hash_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_known_vector() {
        // SHA-256("") is a well-known constant
        assert_eq!(
            hash_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_key_distinct() {
        assert_ne!(hash_key("key-a"), hash_key("key-b"));
        assert_eq!(hash_key("key-a"), hash_key("key-a"));
        assert_eq!(hash_key("key-a").len(), 64);
    }
}
