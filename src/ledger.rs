//! Append-only cost ledger and its summaries.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{ServiceError, ServiceResult};
use crate::store::{AgentCostSummary, CostEntry, CostFilter, Database, NewCostEntry};

/// Per-type totals inside a [`CostSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeBucket {
    pub count: u64,
    pub amount: Decimal,
    pub tokens_input: u64,
    pub tokens_output: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_amount: Decimal,
    pub total_tokens_input: u64,
    pub total_tokens_output: u64,
    pub count: u64,
    pub by_type: BTreeMap<String, TypeBucket>,
}

impl CostSummary {
    /// Fold a set of entries into totals and per-type buckets.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CostEntry>) -> Self {
        let mut summary = CostSummary::default();
        for entry in entries {
            summary.count += 1;
            summary.total_amount += entry.amount;
            summary.total_tokens_input += entry.tokens_input;
            summary.total_tokens_output += entry.tokens_output;

            let bucket = summary.by_type.entry(entry.cost_type.clone()).or_default();
            bucket.count += 1;
            bucket.amount += entry.amount;
            bucket.tokens_input += entry.tokens_input;
            bucket.tokens_output += entry.tokens_output;
        }
        summary
    }
}

#[derive(Clone)]
pub struct CostLedger {
    db: Database,
}

impl CostLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one entry. Store failures propagate to the caller.
    pub async fn record(&self, entry: NewCostEntry) -> ServiceResult<CostEntry> {
        if entry.amount < Decimal::ZERO {
            return Err(ServiceError::Validation(
                "cost amount must not be negative".to_string(),
            ));
        }
        if entry.cost_type.trim().is_empty() {
            return Err(ServiceError::Validation("cost type is required".to_string()));
        }
        let recorded = self.db.insert_cost_entry(entry).await?;
        tracing::debug!(
            "Recorded {} cost of {} {} for user {}",
            recorded.cost_type,
            recorded.amount,
            recorded.currency,
            recorded.user_id
        );
        Ok(recorded)
    }

    /// Totals over the user's entries matching `filter` (inclusive range).
    pub async fn summarize(&self, user_id: i64, filter: CostFilter) -> ServiceResult<CostSummary> {
        let entries = self.db.query_cost_entries(user_id, filter, 0, None).await?;
        Ok(CostSummary::from_entries(&entries))
    }

    pub async fn entries(
        &self,
        user_id: i64,
        filter: CostFilter,
        skip: u32,
        limit: u32,
    ) -> ServiceResult<Vec<CostEntry>> {
        Ok(self
            .db
            .query_cost_entries(user_id, filter, skip, Some(limit))
            .await?)
    }

    pub async fn agent_summary(&self, agent_id: i64) -> ServiceResult<AgentCostSummary> {
        Ok(self.db.agent_cost_summary(agent_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::Role;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    async fn ledger() -> (CostLedger, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let user = seed_user(&db, "u", Role::User).await;
        (CostLedger::new(db), user)
    }

    #[tokio::test]
    async fn empty_summary_is_all_zero() {
        let (ledger, user) = ledger().await;
        let summary = ledger.summarize(user, CostFilter::default()).await.unwrap();
        assert_eq!(summary, CostSummary::default());
        assert_eq!(summary.count, 0);
        assert!(summary.by_type.is_empty());
        assert_eq!(summary.total_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn summary_buckets_by_type() {
        let (ledger, user) = ledger().await;
        ledger
            .record(NewCostEntry::new(user, "llm_call", dec!(0.1)).tokens(10, 20))
            .await
            .unwrap();
        ledger
            .record(NewCostEntry::new(user, "llm_call", dec!(0.2)).tokens(1, 2))
            .await
            .unwrap();
        ledger
            .record(NewCostEntry::new(user, "tool_call", dec!(0.05)))
            .await
            .unwrap();

        let summary = ledger.summarize(user, CostFilter::default()).await.unwrap();
        assert_eq!(summary.count, 3);
        // 0.1 + 0.2 must be exact
        assert_eq!(summary.total_amount, dec!(0.35));
        assert_eq!(summary.total_tokens_input, 11);
        assert_eq!(summary.total_tokens_output, 22);
        let llm = &summary.by_type["llm_call"];
        assert_eq!(llm.count, 2);
        assert_eq!(llm.amount, dec!(0.3));
        assert_eq!(summary.by_type["tool_call"].count, 1);

        let only_tools = ledger
            .summarize(
                user,
                CostFilter {
                    cost_type: Some("tool_call".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(only_tools.count, 1);
        assert_eq!(only_tools.by_type.len(), 1);
    }

    #[tokio::test]
    async fn date_range_is_inclusive_and_scoped_to_user() {
        let (ledger, user) = ledger().await;
        let entry = ledger
            .record(NewCostEntry::new(user, "llm_call", dec!(1)))
            .await
            .unwrap();
        let created = chrono::DateTime::parse_from_rfc3339(&entry.created_at)
            .unwrap()
            .with_timezone(&Utc);

        let exact = CostFilter {
            cost_type: None,
            start: Some(created),
            end: Some(created),
        };
        assert_eq!(ledger.summarize(user, exact).await.unwrap().count, 1);

        let future = CostFilter {
            start: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(ledger.summarize(user, future).await.unwrap().count, 0);

        let other_user = ledger
            .summarize(user + 1, CostFilter::default())
            .await
            .unwrap();
        assert_eq!(other_user.count, 0);
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let (ledger, user) = ledger().await;
        let err = ledger
            .record(NewCostEntry::new(user, "refund", dec!(-1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        ledger
            .record(NewCostEntry::new(user, "free", Decimal::ZERO))
            .await
            .unwrap();
    }
}
