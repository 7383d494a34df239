use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{count_column, decimal_column, Database, StoreError};
use crate::util::{format_timestamp, now_string};

/// One immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEntry {
    pub id: i64,
    pub user_id: i64,
    pub agent_id: Option<i64>,
    pub tool_id: Option<i64>,
    pub execution_id: Option<i64>,
    pub cost_type: String,
    pub amount: Decimal,
    pub currency: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub description: Option<String>,
    pub created_at: String,
}

/// A cost entry waiting to be recorded.
#[derive(Debug, Clone)]
pub struct NewCostEntry {
    pub user_id: i64,
    pub cost_type: String,
    pub amount: Decimal,
    pub agent_id: Option<i64>,
    pub tool_id: Option<i64>,
    pub execution_id: Option<i64>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub description: Option<String>,
    pub currency: String,
}

impl NewCostEntry {
    pub fn new(user_id: i64, cost_type: impl Into<String>, amount: Decimal) -> Self {
        Self {
            user_id,
            cost_type: cost_type.into(),
            amount,
            agent_id: None,
            tool_id: None,
            execution_id: None,
            tokens_input: 0,
            tokens_output: 0,
            description: None,
            currency: "USD".to_string(),
        }
    }

    pub fn agent(mut self, agent_id: i64) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn tool(mut self, tool_id: i64) -> Self {
        self.tool_id = Some(tool_id);
        self
    }

    pub fn execution(mut self, execution_id: i64) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens_input = input;
        self.tokens_output = output;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }
}

/// Optional type and inclusive date-range filter.
#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub cost_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentCostSummary {
    pub agent_id: i64,
    pub total_amount: Decimal,
    pub total_tokens: u64,
    pub total_calls: u64,
}

const COST_COLUMNS: &str = "id, user_id, agent_id, tool_id, execution_id, cost_type, amount, \
     currency, tokens_input, tokens_output, description, created_at";

fn cost_from_row(row: &Row<'_>) -> rusqlite::Result<CostEntry> {
    Ok(CostEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_id: row.get(2)?,
        tool_id: row.get(3)?,
        execution_id: row.get(4)?,
        cost_type: row.get(5)?,
        amount: decimal_column(row, 6)?,
        currency: row.get(7)?,
        tokens_input: count_column(row, 8)?,
        tokens_output: count_column(row, 9)?,
        description: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub(crate) fn insert_cost(conn: &Connection, entry: &NewCostEntry) -> Result<CostEntry, StoreError> {
    conn.execute(
        "INSERT INTO costs (user_id, agent_id, tool_id, execution_id, cost_type, amount,
            currency, tokens_input, tokens_output, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.user_id,
            entry.agent_id,
            entry.tool_id,
            entry.execution_id,
            entry.cost_type,
            entry.amount.to_string(),
            entry.currency,
            entry.tokens_input as i64,
            entry.tokens_output as i64,
            entry.description,
            now_string()
        ],
    )?;
    let id = conn.last_insert_rowid();
    Ok(conn.query_row(
        &format!("SELECT {COST_COLUMNS} FROM costs WHERE id = ?1"),
        params![id],
        cost_from_row,
    )?)
}

impl Database {
    pub async fn insert_cost_entry(&self, entry: NewCostEntry) -> Result<CostEntry, StoreError> {
        self.call(move |conn| insert_cost(conn, &entry)).await
    }

    /// The user's entries matching `filter`, newest first. `limit` of `None`
    /// returns every match.
    pub async fn query_cost_entries(
        &self,
        user_id: i64,
        filter: CostFilter,
        skip: u32,
        limit: Option<u32>,
    ) -> Result<Vec<CostEntry>, StoreError> {
        let start = filter.start.map(format_timestamp);
        let end = filter.end.map(format_timestamp);
        let limit = limit.map(i64::from).unwrap_or(-1);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COST_COLUMNS} FROM costs
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR cost_type = ?2)
                   AND (?3 IS NULL OR created_at >= ?3)
                   AND (?4 IS NULL OR created_at <= ?4)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?5 OFFSET ?6"
            ))?;
            let rows = stmt
                .query_map(
                    params![user_id, filter.cost_type, start, end, limit, skip],
                    cost_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn agent_cost_summary(&self, agent_id: i64) -> Result<AgentCostSummary, StoreError> {
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT amount, tokens_input, tokens_output FROM costs WHERE agent_id = ?1")?;
            let rows = stmt.query_map(params![agent_id], |row| {
                Ok((
                    decimal_column(row, 0)?,
                    count_column(row, 1)?,
                    count_column(row, 2)?,
                ))
            })?;
            let mut summary = AgentCostSummary {
                agent_id,
                ..Default::default()
            };
            for row in rows {
                let (amount, tokens_in, tokens_out) = row?;
                summary.total_amount += amount;
                summary.total_tokens += tokens_in + tokens_out;
                summary.total_calls += 1;
            }
            Ok(summary)
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

    #[tokio::test]
    async fn entries_survive_agent_deletion() {
        let db = Database::open_in_memory().await.unwrap();
        let user = seed_user(&db, "u", Role::User).await;
        let agent = db.create_agent(user, NewAgent::named("a")).await.unwrap();
        db.insert_cost_entry(
            NewCostEntry::new(user, "llm_call", dec!(0.5))
                .agent(agent.id)
                .tokens(4, 6),
        )
        .await
        .unwrap();

        let summary = db.agent_cost_summary(agent.id).await.unwrap();
        assert_eq!(summary.total_amount, dec!(0.5));
        assert_eq!(summary.total_tokens, 10);
        assert_eq!(summary.total_calls, 1);

        db.delete_agent(agent.id).await.unwrap();
        let entries = db
            .query_cost_entries(user, CostFilter::default(), 0, None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].agent_id, None);
        assert_eq!(entries[0].amount, dec!(0.5));
    }

    #[tokio::test]
    async fn type_filter_and_pagination() {
        let db = Database::open_in_memory().await.unwrap();
        let user = seed_user(&db, "u", Role::User).await;
        for (kind, amount) in [("llm_call", dec!(1)), ("tool_call", dec!(2)), ("llm_call", dec!(3))] {
            db.insert_cost_entry(NewCostEntry::new(user, kind, amount))
                .await
                .unwrap();
        }
        let llm = db
            .query_cost_entries(
                user,
                CostFilter {
                    cost_type: Some("llm_call".into()),
                    ..Default::default()
                },
                0,
                None,
            )
            .await
            .unwrap();
        assert_eq!(llm.len(), 2);

        let page = db
            .query_cost_entries(user, CostFilter::default(), 1, Some(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].amount, dec!(2));
    }
}
