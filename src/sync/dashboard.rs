//! Dashboard Aggregator - read-side view over the sync audit trail
//!
//! Aggregates the log store into a summary, per-entity breakdown, filtered
//! log page and pending-conflict list. Results are cached in two TTL caches
//! keyed by the full filter set (summary-only queries live longer than
//! detailed pages). The cache is an optimization only: a miss recomputes
//! from the log store, so correctness never depends on freshness.

use super::conflict::{pending_conflicts, SyncConflict};
use super::logger::{map_entry, SyncLogEntry, SELECT_LOG_ENTRY};
use super::SyncError;
use crate::db::Database;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// TTL for summary-only queries
const SUMMARY_TTL_SECS: u64 = 60;
/// TTL for detailed/paginated queries
const DETAIL_TTL_SECS: u64 = 30;

const MAX_PAGE_LIMIT: u32 = 100;
const CONFLICT_LIST_LIMIT: u32 = 50;

// ============================================================================
// Query & Result Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DashboardView {
    All,
    Conflicts,
    Errors,
}

impl Default for DashboardView {
    fn default() -> Self {
        DashboardView::All
    }
}

/// Filter set for a dashboard query; doubles as the cache key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardQuery {
    pub page: u32,
    pub limit: u32,
    pub status: Option<String>,
    pub entity: Option<String>,
    pub direction: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub search: Option<String>,
    pub view: DashboardView,
    pub summary_only: bool,
}

impl Default for DashboardQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            status: None,
            entity: None,
            direction: None,
            date_from: None,
            date_to: None,
            search: None,
            view: DashboardView::All,
            summary_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub total_runs: i64,
    pub in_progress: i64,
    pub success: i64,
    pub warning: i64,
    pub error: i64,
    pub records_processed: i64,
    pub records_succeeded: i64,
    pub records_failed: i64,
    pub pending_conflicts: i64,
    pub last_run_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityBreakdown {
    pub entity: String,
    pub runs: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub last_status: Option<String>,
    pub last_run_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub summary: DashboardSummary,
    pub entity_breakdown: Vec<EntityBreakdown>,
    pub logs: Vec<SyncLogEntry>,
    pub conflicts: Vec<SyncConflict>,
    pub pagination: Pagination,
}

// ============================================================================
// Aggregator
// ============================================================================

/// Cached read-side aggregation over sync_logs and sync_conflicts
#[derive(Clone)]
pub struct DashboardAggregator {
    db: Arc<Database>,
    summary_cache: Cache<String, Arc<DashboardData>>,
    detail_cache: Cache<String, Arc<DashboardData>>,
}

impl DashboardAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            summary_cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(Duration::from_secs(SUMMARY_TTL_SECS))
                .build(),
            detail_cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(Duration::from_secs(DETAIL_TTL_SECS))
                .build(),
        }
    }

    /// Serve a dashboard query, from cache when fresh
    pub async fn get_dashboard(
        &self,
        query: &DashboardQuery,
    ) -> Result<Arc<DashboardData>, SyncError> {
        let key = serde_json::to_string(query)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let cache = if query.summary_only {
            &self.summary_cache
        } else {
            &self.detail_cache
        };

        if let Some(cached) = cache.get(&key).await {
            return Ok(cached);
        }

        let data = Arc::new(self.compute(query)?);
        cache.insert(key, data.clone()).await;
        Ok(data)
    }

    /// Drop all cached aggregations (after a run finishes, for a fresh read)
    pub async fn invalidate(&self) {
        self.summary_cache.invalidate_all();
        self.detail_cache.invalidate_all();
        self.summary_cache.run_pending_tasks().await;
        self.detail_cache.run_pending_tasks().await;
    }

    fn compute(&self, query: &DashboardQuery) -> Result<DashboardData, SyncError> {
        let (where_sql, params) = build_filter(query);

        let summary = self.summary(&where_sql, &params)?;
        let entity_breakdown = self.breakdown(&where_sql, &params)?;

        let (logs, pagination) = if query.summary_only {
            (
                Vec::new(),
                Pagination {
                    page: query.page.max(1),
                    limit: query.limit,
                    total: summary.total_runs,
                    total_pages: 0,
                },
            )
        } else {
            self.logs_page(query, &where_sql, &params)?
        };

        let conflicts = if query.summary_only {
            Vec::new()
        } else {
            pending_conflicts(&self.db, CONFLICT_LIST_LIMIT)?
        };

        Ok(DashboardData {
            summary,
            entity_breakdown,
            logs,
            conflicts,
            pagination,
        })
    }

    fn summary(&self, where_sql: &str, params: &[String]) -> Result<DashboardSummary, SyncError> {
        let sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'warning' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(records_processed), 0),
                    COALESCE(SUM(records_succeeded), 0),
                    COALESCE(SUM(records_failed), 0),
                    MAX(timestamp)
             FROM sync_logs {}",
            where_sql
        );

        let mut summary = self.db.query_row(
            &sql,
            rusqlite::params_from_iter(params.iter()),
            |row| {
                Ok(DashboardSummary {
                    total_runs: row.get(0)?,
                    in_progress: row.get(1)?,
                    success: row.get(2)?,
                    warning: row.get(3)?,
                    error: row.get(4)?,
                    records_processed: row.get(5)?,
                    records_succeeded: row.get(6)?,
                    records_failed: row.get(7)?,
                    pending_conflicts: 0,
                    last_run_at: row.get(8)?,
                })
            },
        )?;

        summary.pending_conflicts = self.db.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;

        Ok(summary)
    }

    fn breakdown(
        &self,
        where_sql: &str,
        params: &[String],
    ) -> Result<Vec<EntityBreakdown>, SyncError> {
        let sql = format!(
            "SELECT entity,
                    COUNT(*),
                    COALESCE(SUM(records_processed), 0),
                    COALESCE(SUM(records_succeeded), 0),
                    COALESCE(SUM(records_failed), 0),
                    (SELECT status FROM sync_logs inner_logs
                     WHERE inner_logs.entity = sync_logs.entity
                     ORDER BY inner_logs.timestamp DESC LIMIT 1),
                    MAX(timestamp)
             FROM sync_logs {}
             GROUP BY entity
             ORDER BY entity",
            where_sql
        );

        Ok(self.db.query(
            &sql,
            rusqlite::params_from_iter(params.iter()),
            |row| {
                Ok(EntityBreakdown {
                    entity: row.get(0)?,
                    runs: row.get(1)?,
                    processed: row.get(2)?,
                    succeeded: row.get(3)?,
                    failed: row.get(4)?,
                    last_status: row.get(5)?,
                    last_run_at: row.get(6)?,
                })
            },
        )?)
    }

    fn logs_page(
        &self,
        query: &DashboardQuery,
        where_sql: &str,
        params: &[String],
    ) -> Result<(Vec<SyncLogEntry>, Pagination), SyncError> {
        let total: i64 = self.db.query_row(
            &format!("SELECT COUNT(*) FROM sync_logs {}", where_sql),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let page = query.page.max(1);
        let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1) as i64 * limit as i64;

        let sql = format!(
            "{} {} ORDER BY timestamp DESC LIMIT {} OFFSET {}",
            SELECT_LOG_ENTRY, where_sql, limit, offset
        );

        let logs = self
            .db
            .query(&sql, rusqlite::params_from_iter(params.iter()), map_entry)?;

        let total_pages = (total + limit as i64 - 1) / limit as i64;

        Ok((
            logs,
            Pagination {
                page,
                limit,
                total,
                total_pages,
            },
        ))
    }
}

/// Escape LIKE wildcards so a search term matches literally
fn escape_like_pattern(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Build the WHERE clause and its positional parameters for a filter set
fn build_filter(query: &DashboardQuery) -> (String, Vec<String>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<String> = Vec::new();

    let push = |conditions: &mut Vec<String>, params: &mut Vec<String>, cond: &str, value: String| {
        params.push(value);
        conditions.push(cond.replace("?n", &format!("?{}", params.len())));
    };

    // The errors view is a fixed status filter; an explicit status filter
    // takes precedence elsewhere
    match (&query.view, &query.status) {
        (DashboardView::Errors, _) => {
            push(&mut conditions, &mut params, "status = ?n", "error".to_string());
        }
        (_, Some(status)) => {
            push(&mut conditions, &mut params, "status = ?n", status.clone());
        }
        _ => {}
    }

    if let Some(entity) = &query.entity {
        push(&mut conditions, &mut params, "entity = ?n", entity.clone());
    }
    if let Some(direction) = &query.direction {
        push(&mut conditions, &mut params, "direction = ?n", direction.clone());
    }
    if let Some(from) = &query.date_from {
        push(&mut conditions, &mut params, "timestamp >= ?n", from.clone());
    }
    if let Some(to) = &query.date_to {
        push(&mut conditions, &mut params, "timestamp <= ?n", to.clone());
    }
    if let Some(search) = &query.search {
        let pattern = format!("%{}%", escape_like_pattern(search));
        params.push(pattern);
        conditions.push(format!(
            "(message LIKE ?{n} ESCAPE '\\' OR entity LIKE ?{n} ESCAPE '\\')",
            n = params.len()
        ));
    }

    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), params)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::logger::{SyncDirection, SyncLogger, SyncRunStatus};

    fn seeded() -> (DashboardAggregator, SyncLogger, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let logger = SyncLogger::new(db.clone());

        for (entity, status, processed, failed) in [
            ("contact", SyncRunStatus::Success, 40, 0),
            ("contact", SyncRunStatus::Warning, 25, 3),
            ("invoice", SyncRunStatus::Error, 10, 10),
            ("payment", SyncRunStatus::Success, 12, 0),
        ] {
            let id = logger.start_run(None, SyncDirection::Pull, entity).unwrap();
            logger
                .finalize_run(
                    &id,
                    status,
                    processed,
                    processed - failed,
                    failed,
                    &format!("{} run", entity),
                    None,
                    100,
                )
                .unwrap();
        }

        (DashboardAggregator::new(db.clone()), logger, db)
    }

    #[tokio::test]
    async fn test_summary_counts_by_status() {
        let (aggregator, _logger, _db) = seeded();

        let data = aggregator
            .get_dashboard(&DashboardQuery::default())
            .await
            .unwrap();

        assert_eq!(data.summary.total_runs, 4);
        assert_eq!(data.summary.success, 2);
        assert_eq!(data.summary.warning, 1);
        assert_eq!(data.summary.error, 1);
        assert_eq!(data.summary.records_processed, 87);
        assert_eq!(data.summary.records_failed, 13);
        assert!(data.summary.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_entity_filter_narrows_logs_and_summary() {
        let (aggregator, _logger, _db) = seeded();

        let query = DashboardQuery {
            entity: Some("contact".to_string()),
            ..Default::default()
        };
        let data = aggregator.get_dashboard(&query).await.unwrap();

        assert_eq!(data.summary.total_runs, 2);
        assert_eq!(data.logs.len(), 2);
        assert!(data.logs.iter().all(|l| l.entity == "contact"));
        assert_eq!(data.entity_breakdown.len(), 1);
        assert_eq!(data.entity_breakdown[0].entity, "contact");
    }

    #[tokio::test]
    async fn test_errors_view_shows_only_error_runs() {
        let (aggregator, _logger, _db) = seeded();

        let query = DashboardQuery {
            view: DashboardView::Errors,
            ..Default::default()
        };
        let data = aggregator.get_dashboard(&query).await.unwrap();

        assert_eq!(data.logs.len(), 1);
        assert_eq!(data.logs[0].status, SyncRunStatus::Error);
    }

    #[tokio::test]
    async fn test_pagination_totals() {
        let (aggregator, _logger, _db) = seeded();

        let query = DashboardQuery {
            limit: 3,
            ..Default::default()
        };
        let data = aggregator.get_dashboard(&query).await.unwrap();

        assert_eq!(data.pagination.total, 4);
        assert_eq!(data.pagination.total_pages, 2);
        assert_eq!(data.logs.len(), 3);

        let page2 = DashboardQuery {
            page: 2,
            limit: 3,
            ..Default::default()
        };
        let data = aggregator.get_dashboard(&page2).await.unwrap();
        assert_eq!(data.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_summary_only_skips_detail_sections() {
        let (aggregator, _logger, _db) = seeded();

        let query = DashboardQuery {
            summary_only: true,
            ..Default::default()
        };
        let data = aggregator.get_dashboard(&query).await.unwrap();

        assert!(data.logs.is_empty());
        assert!(data.conflicts.is_empty());
        assert_eq!(data.summary.total_runs, 4);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_until_invalidated() {
        let (aggregator, logger, _db) = seeded();

        let query = DashboardQuery::default();
        let before = aggregator.get_dashboard(&query).await.unwrap();
        assert_eq!(before.summary.total_runs, 4);

        // New run lands while the cache entry is fresh
        let id = logger
            .start_run(None, SyncDirection::Pull, "contact")
            .unwrap();
        logger
            .finalize_run(&id, SyncRunStatus::Success, 1, 1, 0, "late run", None, 5)
            .unwrap();

        let cached = aggregator.get_dashboard(&query).await.unwrap();
        assert_eq!(cached.summary.total_runs, 4);

        aggregator.invalidate().await;
        let fresh = aggregator.get_dashboard(&query).await.unwrap();
        assert_eq!(fresh.summary.total_runs, 5);
    }

    #[tokio::test]
    async fn test_search_escapes_like_wildcards() {
        let (aggregator, logger, _db) = seeded();

        let id = logger
            .start_run(None, SyncDirection::Pull, "contact")
            .unwrap();
        logger
            .finalize_run(
                &id,
                SyncRunStatus::Success,
                1,
                1,
                0,
                "100% reconciled",
                None,
                5,
            )
            .unwrap();

        // A literal '%' must not act as a wildcard
        let query = DashboardQuery {
            search: Some("100%".to_string()),
            ..Default::default()
        };
        let data = aggregator.get_dashboard(&query).await.unwrap();
        assert_eq!(data.logs.len(), 1);
        assert_eq!(data.logs[0].message.as_deref(), Some("100% reconciled"));
    }
}
