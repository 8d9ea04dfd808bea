//! Migration runner over the configured migration list.

use crate::config::Migration;
use crate::error::{Error, Result};
use crate::store::Store;

/// Apply every configured migration that is not yet recorded, in version
/// order. Stops at the first failure so the applied set stays a prefix of
/// the configured versions.
pub async fn apply_pending(store: &Store, migrations: &[Migration]) -> Result<()> {
    let applied = store.get_applied_versions().await?;
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        if migration.rollout.is_empty() {
            tracing::warn!(
                "migration version {} has no rollout statements, skipping",
                migration.version
            );
            continue;
        }
        tracing::info!("applying migration version {}", migration.version);
        store
            .apply_migration(migration.version, &migration.rollout)
            .await?;
    }
    Ok(())
}

/// Roll back a single migration version. With `version: None` the most
/// recently applied version is rolled back.
pub async fn rollback(
    store: &Store,
    migrations: &[Migration],
    version: Option<i64>,
) -> Result<()> {
    let applied = store.get_applied_versions().await?;
    let version = match version.or_else(|| applied.last().copied()) {
        Some(v) => v,
        None => {
            return Err(Error::Validation(
                "no applied migrations to roll back".to_string(),
            ))
        }
    };
    if !applied.contains(&version) {
        return Err(Error::Validation(format!(
            "migration version {version} not applied, nothing to roll back"
        )));
    }
    let migration = migrations
        .iter()
        .find(|m| m.version == version)
        .ok_or_else(|| {
            Error::Validation(format!(
                "migration version {version} not found in configuration"
            ))
        })?;
    if migration.rollback.is_empty() {
        return Err(Error::Validation(format!(
            "migration version {version} has no rollback statements"
        )));
    }
    store.rollback_migration(version, &migration.rollback).await
}
