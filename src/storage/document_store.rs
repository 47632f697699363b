//! Document-store backing for flow snapshots.
//!
//! One row per flow: the columns the queries filter on, plus the full
//! snapshot as a JSON document. Resume conditions live in their own table
//! indexed on `next_check`. Timestamps are stored as fixed-width RFC 3339
//! text so lexicographic comparison matches chronological order.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::engine::types::{
    FlowState, FlowStatus, FlowSummary, PagedResult, QueryCriteria, ResumeConditionRecord,
};
use crate::storage::{StateStore, StoreError};

const TERMINAL_STATUSES: [&str; 3] = ["completed", "failed", "cancelled"];

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS flows (
        flow_id TEXT PRIMARY KEY,
        flow_kind TEXT NOT NULL,
        principal_id TEXT NOT NULL,
        correlation_id TEXT,
        status TEXT NOT NULL,
        pause_reason TEXT,
        version BIGINT NOT NULL,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        last_updated_at TEXT NOT NULL,
        snapshot TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_flows_status ON flows (status)",
    "CREATE INDEX IF NOT EXISTS idx_flows_principal ON flows (principal_id)",
    "CREATE INDEX IF NOT EXISTS idx_flows_correlation ON flows (correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_flows_kind ON flows (flow_kind)",
    "CREATE INDEX IF NOT EXISTS idx_flows_created ON flows (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_flows_status_created ON flows (status, created_at)",
    "CREATE TABLE IF NOT EXISTS resume_conditions (
        flow_id TEXT PRIMARY KEY,
        check_interval_ms BIGINT NOT NULL,
        next_check TEXT NOT NULL,
        max_retries BIGINT NOT NULL,
        current_retries BIGINT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_resume_next_check ON resume_conditions (next_check)",
];

/// Document store over any sqlx-supported backend (sqlite by default, the
/// `postgres` feature adds the Postgres driver).
pub struct DocumentStore {
    pool: AnyPool,
}

impl DocumentStore {
    /// Connect and create the schema if it does not exist.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let pool = AnyPool::connect(url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect to '{}': {}", url, e)))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(backend)?;
        }

        Ok(Self { pool })
    }

    /// Connect using `TIDEFLOW_DATABASE_URL` (a `.env` file is honored).
    pub async fn connect_from_env() -> Result<Self, StoreError> {
        dotenvy::dotenv().ok();
        let url = std::env::var("TIDEFLOW_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://tideflow.db?mode=rwc".to_string());
        Self::connect(&url).await
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_snapshot(row: &AnyRow) -> Result<FlowState, StoreError> {
    let snapshot: String = row.try_get("snapshot").map_err(backend)?;
    serde_json::from_str(&snapshot)
        .map_err(|e| StoreError::Backend(format!("corrupt snapshot: {}", e)))
}

#[async_trait]
impl StateStore for DocumentStore {
    async fn save(&self, state: &FlowState) -> Result<u64, StoreError> {
        let mut stored = state.clone();
        stored.version = state.version + 1;
        stored.last_updated_at = Utc::now();

        let snapshot = serde_json::to_string(&stored)
            .map_err(|e| StoreError::Backend(format!("failed to serialize snapshot: {}", e)))?;
        let flow_id = state.flow_id.to_string();

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let existing = sqlx::query("SELECT version, status FROM flows WHERE flow_id = ?")
            .bind(&flow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

        match existing {
            None => {
                if state.version != 0 {
                    return Err(StoreError::NotFound(state.flow_id));
                }
                sqlx::query(
                    "INSERT INTO flows (flow_id, flow_kind, principal_id, correlation_id, \
                     status, pause_reason, version, created_at, completed_at, \
                     last_updated_at, snapshot) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&flow_id)
                .bind(&stored.flow_kind)
                .bind(&stored.principal_id)
                .bind(stored.correlation_id.as_deref())
                .bind(stored.status.to_string())
                .bind(stored.pause.as_ref().map(|p| p.reason.clone()))
                .bind(stored.version as i64)
                .bind(ts(stored.created_at))
                .bind(stored.completed_at.map(ts))
                .bind(ts(stored.last_updated_at))
                .bind(&snapshot)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            }
            Some(row) => {
                let current_version: i64 = row.try_get("version").map_err(backend)?;
                let current_status: String = row.try_get("status").map_err(backend)?;

                if TERMINAL_STATUSES.contains(&current_status.as_str()) {
                    return Err(StoreError::TerminalFlow {
                        flow_id: state.flow_id,
                    });
                }
                if current_version != state.version as i64 {
                    return Err(StoreError::ConcurrencyConflict {
                        flow_id: state.flow_id,
                        expected: state.version,
                    });
                }

                let result = sqlx::query(
                    "UPDATE flows SET status = ?, pause_reason = ?, version = ?, \
                     completed_at = ?, last_updated_at = ?, snapshot = ? \
                     WHERE flow_id = ? AND version = ?",
                )
                .bind(stored.status.to_string())
                .bind(stored.pause.as_ref().map(|p| p.reason.clone()))
                .bind(stored.version as i64)
                .bind(stored.completed_at.map(ts))
                .bind(ts(stored.last_updated_at))
                .bind(&snapshot)
                .bind(&flow_id)
                .bind(state.version as i64)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::ConcurrencyConflict {
                        flow_id: state.flow_id,
                        expected: state.version,
                    });
                }
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(stored.version)
    }

    async fn load(&self, flow_id: Uuid) -> Result<FlowState, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM flows WHERE flow_id = ?")
            .bind(flow_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound(flow_id))?;

        parse_snapshot(&row)
    }

    async fn load_by_statuses(
        &self,
        statuses: &[FlowStatus],
    ) -> Result<Vec<FlowState>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT snapshot FROM flows WHERE status IN ({}) ORDER BY created_at DESC",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.to_string());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(parse_snapshot).collect()
    }

    async fn query(
        &self,
        criteria: &QueryCriteria,
        page: usize,
        page_size: usize,
    ) -> Result<PagedResult<FlowSummary>, StoreError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref statuses) = criteria.statuses
            && !statuses.is_empty()
        {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            clauses.push(format!("status IN ({})", placeholders));
            binds.extend(statuses.iter().map(|s| s.to_string()));
        }
        if let Some(ref p) = criteria.principal_id {
            clauses.push("principal_id = ?".to_string());
            binds.push(p.clone());
        }
        if let Some(ref c) = criteria.correlation_id {
            clauses.push("correlation_id = ?".to_string());
            binds.push(c.clone());
        }
        if let Some(ref k) = criteria.flow_kind {
            clauses.push("flow_kind = ?".to_string());
            binds.push(k.clone());
        }
        if let Some(after) = criteria.created_after {
            clauses.push("created_at >= ?".to_string());
            binds.push(ts(after));
        }
        if let Some(before) = criteria.created_before {
            clauses.push("created_at < ?".to_string());
            binds.push(ts(before));
        }
        if let Some(ref reason) = criteria.pause_reason {
            clauses.push("pause_reason = ?".to_string());
            binds.push(reason.clone());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) AS n FROM flows{}", where_clause);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind.as_str());
        }
        let count_row = count_query.fetch_one(&self.pool).await.map_err(backend)?;
        let total: i64 = count_row.try_get("n").map_err(backend)?;

        let page_sql = format!(
            "SELECT snapshot FROM flows{} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let mut page_query = sqlx::query(&page_sql);
        for bind in &binds {
            page_query = page_query.bind(bind.as_str());
        }
        page_query = page_query
            .bind(page_size as i64)
            .bind((page * page_size) as i64);

        let rows = page_query.fetch_all(&self.pool).await.map_err(backend)?;
        let items = rows
            .iter()
            .map(|row| parse_snapshot(row).map(|state| FlowSummary::from(&state)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PagedResult {
            items,
            page,
            page_size,
            total: total as u64,
        })
    }

    async fn delete_terminal_older_than(&self, age: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());

        let result = sqlx::query(
            "DELETE FROM flows WHERE status IN ('completed', 'failed', 'cancelled') \
             AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(ts(cutoff))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected())
    }

    async fn save_resume_condition(
        &self,
        condition: &ResumeConditionRecord,
    ) -> Result<(), StoreError> {
        let flow_id = condition.flow_id.to_string();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query("DELETE FROM resume_conditions WHERE flow_id = ?")
            .bind(&flow_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        sqlx::query(
            "INSERT INTO resume_conditions (flow_id, check_interval_ms, next_check, \
             max_retries, current_retries, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&flow_id)
        .bind(condition.check_interval.as_millis() as i64)
        .bind(ts(condition.next_check))
        .bind(condition.max_retries as i64)
        .bind(condition.current_retries as i64)
        .bind(ts(condition.created_at))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)
    }

    async fn delete_resume_condition(&self, flow_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM resume_conditions WHERE flow_id = ?")
            .bind(flow_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn due_resume_conditions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResumeConditionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT flow_id, check_interval_ms, next_check, max_retries, \
             current_retries, created_at FROM resume_conditions \
             WHERE next_check <= ? ORDER BY next_check ASC",
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let flow_id: String = row.try_get("flow_id").map_err(backend)?;
                let interval_ms: i64 = row.try_get("check_interval_ms").map_err(backend)?;
                let next_check: String = row.try_get("next_check").map_err(backend)?;
                let max_retries: i64 = row.try_get("max_retries").map_err(backend)?;
                let current_retries: i64 = row.try_get("current_retries").map_err(backend)?;
                let created_at: String = row.try_get("created_at").map_err(backend)?;

                Ok(ResumeConditionRecord {
                    flow_id: Uuid::from_str(&flow_id)
                        .map_err(|e| StoreError::Backend(format!("corrupt flow id: {}", e)))?,
                    check_interval: Duration::from_millis(interval_ms as u64),
                    next_check: DateTime::parse_from_rfc3339(&next_check)
                        .map_err(|e| StoreError::Backend(format!("corrupt timestamp: {}", e)))?
                        .with_timezone(&Utc),
                    max_retries: max_retries as u32,
                    current_retries: current_retries as u32,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| StoreError::Backend(format!("corrupt timestamp: {}", e)))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }
}
