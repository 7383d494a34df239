use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{count_column, decimal_column, Database, StoreError};
use crate::util::{format_timestamp, now_string};

/// Lifecycle of one agent invocation. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: i64,
    pub agent_id: i64,
    pub user_id: i64,
    pub input_data: String,
    pub output_data: Option<String>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub tokens_used: u64,
    pub cost: Decimal,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// How a running execution ended.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed {
        output: String,
        execution_time_ms: u64,
        tokens_used: u64,
        cost: Decimal,
    },
    Failed {
        error: String,
        execution_time_ms: u64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub agent_id: Option<i64>,
    pub skip: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_ms: f64,
    pub total_tokens_used: u64,
    pub total_cost: Decimal,
}

const EXECUTION_COLUMNS: &str = "id, agent_id, user_id, input_data, output_data, status, \
     error_message, execution_time_ms, tokens_used, cost, started_at, completed_at";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(5)?;
    let time_ms: Option<i64> = row.get(7)?;
    Ok(Execution {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        user_id: row.get(2)?,
        input_data: row.get(3)?,
        output_data: row.get(4)?,
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
        error_message: row.get(6)?,
        execution_time_ms: time_ms.map(|ms| ms.max(0) as u64),
        tokens_used: count_column(row, 8)?,
        cost: decimal_column(row, 9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn query_execution(conn: &Connection, id: i64) -> rusqlite::Result<Option<Execution>> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
        params![id],
        execution_from_row,
    )
    .optional()
}

impl Database {
    /// Insert a new execution directly in the `running` state.
    pub async fn insert_running_execution(
        &self,
        agent_id: i64,
        user_id: i64,
        input: &str,
    ) -> Result<Execution, StoreError> {
        let input = input.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO executions (agent_id, user_id, input_data, status, tokens_used, cost, started_at)
                 VALUES (?1, ?2, ?3, 'running', 0, '0', ?4)",
                params![agent_id, user_id, input, now_string()],
            )?;
            let id = conn.last_insert_rowid();
            query_execution(conn, id)?.ok_or_else(|| {
                StoreError::Conflict(format!("execution {id} vanished after insert"))
            })
        })
        .await
    }

    /// Move a running execution to its terminal state.
    ///
    /// Fails with `StoreError::Conflict` if the execution is not running.
    pub async fn finish_execution(
        &self,
        id: i64,
        outcome: ExecutionOutcome,
    ) -> Result<Execution, StoreError> {
        self.call(move |conn| {
            let now = now_string();
            let changed = match outcome {
                ExecutionOutcome::Completed {
                    output,
                    execution_time_ms,
                    tokens_used,
                    cost,
                } => conn.execute(
                    "UPDATE executions SET status = 'completed', output_data = ?1,
                        execution_time_ms = ?2, tokens_used = ?3, cost = ?4, completed_at = ?5
                     WHERE id = ?6 AND status = 'running'",
                    params![
                        output,
                        execution_time_ms as i64,
                        tokens_used as i64,
                        cost.to_string(),
                        now,
                        id
                    ],
                )?,
                ExecutionOutcome::Failed {
                    error,
                    execution_time_ms,
                } => conn.execute(
                    "UPDATE executions SET status = 'failed', error_message = ?1,
                        execution_time_ms = ?2, completed_at = ?3
                     WHERE id = ?4 AND status = 'running'",
                    params![error, execution_time_ms as i64, now, id],
                )?,
            };
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "execution {id} is not running"
                )));
            }
            query_execution(conn, id)?
                .ok_or_else(|| StoreError::Conflict(format!("execution {id} vanished")))
        })
        .await
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<Execution>, StoreError> {
        self.call(move |conn| Ok(query_execution(conn, id)?)).await
    }

    /// Executions started by `user_id`, most recent first.
    pub async fn list_executions(
        &self,
        user_id: i64,
        filter: ExecutionFilter,
    ) -> Result<Vec<Execution>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR agent_id = ?3)
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?4 OFFSET ?5"
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        user_id,
                        filter.status.map(|s| s.as_str()),
                        filter.agent_id,
                        filter.limit,
                        filter.skip
                    ],
                    execution_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Aggregate the user's executions started within `[start, end]`.
    pub async fn usage_metrics(
        &self,
        user_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<UsageMetrics, StoreError> {
        let start = start.map(format_timestamp);
        let end = end.map(format_timestamp);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, execution_time_ms, tokens_used, cost FROM executions
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR started_at >= ?2)
                   AND (?3 IS NULL OR started_at <= ?3)",
            )?;
            let rows = stmt.query_map(params![user_id, start, end], |row| {
                let status: String = row.get(0)?;
                let time_ms: Option<i64> = row.get(1)?;
                Ok((status, time_ms, count_column(row, 2)?, decimal_column(row, 3)?))
            })?;

            let mut metrics = UsageMetrics::default();
            let mut timed = 0u64;
            let mut time_total = 0i64;
            for row in rows {
                let (status, time_ms, tokens, cost) = row?;
                metrics.total_executions += 1;
                match ExecutionStatus::parse(&status) {
                    Some(ExecutionStatus::Completed) => metrics.successful_executions += 1,
                    Some(ExecutionStatus::Failed) => metrics.failed_executions += 1,
                    _ => {}
                }
                if let Some(ms) = time_ms {
                    timed += 1;
                    time_total += ms;
                }
                metrics.total_tokens_used += tokens;
                metrics.total_cost += cost;
            }
            if timed > 0 {
                metrics.average_execution_time_ms = time_total as f64 / timed as f64;
            }
            Ok(metrics)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::{NewAgent, Role};
    use rust_decimal_macros::dec;

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let user = seed_user(&db, "u", Role::User).await;
        let agent = db.create_agent(user, NewAgent::named("a")).await.unwrap();
        (db, user, agent.id)
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let (db, user, agent) = setup().await;
        let exec = db.insert_running_execution(agent, user, "hi").await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.completed_at.is_none());

        let done = db
            .finish_execution(
                exec.id,
                ExecutionOutcome::Completed {
                    output: "hello".into(),
                    execution_time_ms: 12,
                    tokens_used: 3,
                    cost: dec!(0.000006),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.cost, dec!(0.000006));
        assert!(done.completed_at.is_some());

        let again = db
            .finish_execution(
                exec.id,
                ExecutionOutcome::Failed {
                    error: "late".into(),
                    execution_time_ms: 1,
                },
            )
            .await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));
        let stored = db.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn usage_metrics_aggregate_outcomes() {
        let (db, user, agent) = setup().await;
        let ok = db.insert_running_execution(agent, user, "a").await.unwrap();
        db.finish_execution(
            ok.id,
            ExecutionOutcome::Completed {
                output: "x".into(),
                execution_time_ms: 100,
                tokens_used: 10,
                cost: dec!(0.02),
            },
        )
        .await
        .unwrap();
        let bad = db.insert_running_execution(agent, user, "b").await.unwrap();
        db.finish_execution(
            bad.id,
            ExecutionOutcome::Failed {
                error: "boom".into(),
                execution_time_ms: 50,
            },
        )
        .await
        .unwrap();
        db.insert_running_execution(agent, user, "c").await.unwrap();

        let metrics = db.usage_metrics(user, None, None).await.unwrap();
        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.successful_executions, 1);
        assert_eq!(metrics.failed_executions, 1);
        assert_eq!(metrics.average_execution_time_ms, 75.0);
        assert_eq!(metrics.total_tokens_used, 10);
        assert_eq!(metrics.total_cost, dec!(0.02));

        let failed = db
            .list_executions(
                user,
                ExecutionFilter {
                    status: Some(ExecutionStatus::Failed),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("boom"));
    }
}
