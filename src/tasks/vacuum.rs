//! Periodic retention enforcement: age-based and size-based deletion plus
//! free-page reclamation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::store::{CheckpointMode, QueryFilter, QueryOperator, Store};

/// Id-range span per delete statement when trimming by size, keeping each
/// transaction bounded.
const DELETE_BATCH_SPAN: i64 = 10_000;

/// sqlite auto_vacuum mode codes.
const AUTO_VACUUM_INCREMENTAL: i64 = 2;

pub struct VacuumTask {
    store: Arc<Store>,
    interval: Duration,
    max_days: i64,
    max_size_mb: f64,
    target_size_mb: f64,
    timestamp_field: String,
}

impl VacuumTask {
    pub fn new(store: Arc<Store>, config: &Config) -> Self {
        Self {
            store,
            interval: Duration::from_secs(config.task_vacuum_interval),
            max_days: config.vacuum_max_days,
            max_size_mb: config.vacuum_max_size_mb,
            target_size_mb: config.vacuum_target_size_mb,
            timestamp_field: config.log_timestamp_field.clone(),
        }
    }

    /// Run one pass per interval until cancelled. A failed pass is logged
    /// and the next tick proceeds.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("vacuum task interval: {}s", self.interval.as_secs());
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_once().await {
                tracing::error!("vacuum pass failed: {e}");
            }
        }
    }

    pub async fn run_once(&self) -> Result<()> {
        // Checkpoint first so the size reading below is accurate.
        self.store.wal_checkpoint(CheckpointMode::Truncate).await?;

        let columns = self.store.get_log_columns().await?;
        if columns.iter().any(|c| c.name == self.timestamp_field) {
            let removed = remove_stale_logs(&self.store, &self.timestamp_field, self.max_days).await?;
            if removed > 0 {
                tracing::info!(
                    "[log cleanup] removed {removed} stale log entries (max retention days = {})",
                    self.max_days
                );
            }
        } else {
            tracing::warn!(
                "timestamp column '{}' not found, unable to remove stale logs",
                self.timestamp_field
            );
        }

        let size = self.store.get_size_mb().await?;
        let removed = remove_excessive_logs(
            &self.store,
            size,
            self.max_size_mb,
            self.target_size_mb,
            DELETE_BATCH_SPAN,
        )
        .await?;
        if removed > 0 {
            let size = self.store.get_size_mb().await?;
            tracing::info!("[log cleanup] removed {removed} log entries, database size is now {size:.1} MB");
        }

        reclaim_free_pages(&self.store).await?;
        Ok(())
    }
}

/// Delete records whose timestamp is older than `max_age_days`.
pub async fn remove_stale_logs(store: &Store, timestamp_field: &str, max_age_days: i64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
    store
        .delete(&[QueryFilter {
            field: timestamp_field.to_string(),
            operator: QueryOperator::Le,
            value: json!(cutoff.to_rfc3339()),
        }])
        .await
}

/// When the database exceeds `max_size_mb`, delete the oldest records by id
/// until roughly `target_size_mb` worth remain. The share to remove is
/// `(size - target) / size` of the id span, assuming ids correlate with
/// insertion order (the single writer guarantees this). Deletes run in
/// bounded id-range batches of `batch_span`.
pub async fn remove_excessive_logs(
    store: &Store,
    db_size_mb: f64,
    max_size_mb: f64,
    target_size_mb: f64,
    batch_span: i64,
) -> Result<usize> {
    if db_size_mb <= max_size_mb {
        return Ok(0);
    }
    let min_id = store.get_min_log_id().await?;
    let max_id = store.get_max_log_id().await?;
    if max_id == 0 {
        return Ok(0);
    }
    let count = max_id - min_id + 1;
    let remove_pct = (db_size_mb - target_size_mb) / db_size_mb;
    let remove_count = (count as f64 * remove_pct) as i64;
    if remove_count <= 0 {
        return Ok(0);
    }
    let remove_before = min_id + remove_count - 1;

    let mut removed = 0;
    let mut upper = (min_id + batch_span - 1).min(remove_before);
    loop {
        removed += store
            .delete(&[QueryFilter {
                field: "id".to_string(),
                operator: QueryOperator::Le,
                value: json!(upper),
            }])
            .await?;
        if upper >= remove_before {
            break;
        }
        upper = (upper + batch_span).min(remove_before);
    }
    Ok(removed)
}

/// Free the current freelist with an incremental vacuum; returns the number
/// of free pages remaining afterwards. Only effective in INCREMENTAL mode.
pub async fn incremental_vacuum(store: &Store) -> Result<i64> {
    let freelist = store.get_pragma("freelist_count").await?;
    if freelist > 0 {
        store.incremental_vacuum(freelist).await?;
    }
    store.get_pragma("freelist_count").await
}

/// Reclaim free pages according to the configured auto_vacuum mode. In FULL
/// mode pages are reclaimed at commit, so only INCREMENTAL needs work here.
pub async fn reclaim_free_pages(store: &Store) -> Result<()> {
    if store.get_pragma("auto_vacuum").await? == AUTO_VACUUM_INCREMENTAL {
        let remaining = incremental_vacuum(store).await?;
        tracing::debug!("incremental vacuum done, {remaining} free pages remaining");
    }
    Ok(())
}
