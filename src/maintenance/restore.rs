use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::maintenance::table::TableRef;

/// Restore metadata recorded by a successful archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestorePlan {
    pub table: TableRef,
    pub archive_table: TableRef,
    pub retention_days: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub registered_at: DateTime<Utc>,
}

/// Latest restore plan per source table. Every archive overwrites the entry.
#[derive(Debug, Clone, Default)]
pub struct RestorePlans {
    plans: Arc<RwLock<HashMap<TableRef, RestorePlan>>>,
}

impl RestorePlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, plan: RestorePlan) -> Option<RestorePlan> {
        let mut plans = self.plans.write().await;
        let previous = plans.insert(plan.table.clone(), plan.clone());
        if let Some(previous) = &previous {
            if previous.retention_days != plan.retention_days {
                info!(
                    table = %plan.table,
                    previous_days = previous.retention_days,
                    retention_days = plan.retention_days,
                    "restore plan retention replaced"
                );
            }
        }
        previous
    }

    pub async fn get(&self, table: &TableRef) -> Option<RestorePlan> {
        self.plans.read().await.get(table).cloned()
    }

    pub async fn all(&self) -> Vec<RestorePlan> {
        let mut plans: Vec<_> = self.plans.read().await.values().cloned().collect();
        plans.sort_by(|a, b| a.table.key().cmp(&b.table.key()));
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(days: u32) -> RestorePlan {
        let table = TableRef::new("public", "orders").unwrap();
        RestorePlan {
            archive_table: table.archive().unwrap(),
            table,
            retention_days: days,
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn later_archive_overwrites_plan() {
        let plans = RestorePlans::new();
        assert!(plans.register(plan(30)).await.is_none());
        let previous = plans.register(plan(7)).await.expect("previous plan");
        assert_eq!(previous.retention_days, 30);

        let table = TableRef::new("public", "orders").unwrap();
        assert_eq!(plans.get(&table).await.map(|p| p.retention_days), Some(7));
        assert_eq!(plans.all().await.len(), 1);
    }
}
