//! Canonical registry tables and the per-invocation staging tables used to diff into them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use orgreg_core::{RegistryEntry, RegistryEntrySetting, RowRange, StagingRow};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::job::BatchId;

const STAGING_PREFIX: &str = "registry_staging_";
const INSERT_CHUNK_ROWS: usize = 1_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub entries_changed: u64,
    pub settings_pruned: u64,
    pub settings_changed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub entries: u64,
    pub settings: u64,
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Create an empty staging table, replacing any leftover of the same name.
    async fn create_staging(&self, name: &str) -> Result<(), PipelineError>;
    async fn insert_staging(&self, name: &str, rows: &[StagingRow]) -> Result<(), PipelineError>;
    /// Upsert entries, prune orphan settings and upsert settings from staging, atomically.
    async fn reconcile_staging(&self, name: &str) -> Result<ReconcileStats, PipelineError>;
    async fn drop_staging(&self, name: &str) -> Result<(), PipelineError>;
    async fn counts(&self) -> Result<RegistryCounts, PipelineError>;
}

/// Staging table name unique to one row range of one import batch.
pub fn staging_table_name(batch: BatchId, range: RowRange) -> String {
    let simple = batch.0.simple().to_string();
    format!("{STAGING_PREFIX}{}_{}_{}", &simple[..12], range.start, range.end)
}

fn checked_staging_name(name: &str) -> Result<&str, PipelineError> {
    let valid = name.starts_with(STAGING_PREFIX)
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(PipelineError::Staging(format!("name {name:?} is not a valid identifier")))
    }
}

/// Run `work` against a freshly created staging table and drop the table on every exit
/// path, including the caller's future being dropped mid-way (a job timeout).
pub async fn with_staging<S, T, F, Fut>(
    store: &Arc<S>,
    name: &str,
    work: F,
) -> Result<T, PipelineError>
where
    S: RegistryStore + ?Sized + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut guard = StagingGuard {
        store: store.clone(),
        name: Some(name.to_string()),
    };
    let result = match store.create_staging(name).await {
        Ok(()) => work().await,
        Err(err) => Err(err),
    };
    let dropped = store.drop_staging(name).await;
    guard.name = None;
    match dropped {
        Ok(()) => result,
        Err(err) => {
            warn!(staging = name, error = %err, "failed to drop staging table");
            result.and(Err(err))
        }
    }
}

/// Drops a staging table from a background task when `with_staging` is abandoned.
struct StagingGuard<S: RegistryStore + ?Sized + 'static> {
    store: Arc<S>,
    name: Option<String>,
}

impl<S: RegistryStore + ?Sized + 'static> Drop for StagingGuard<S> {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(staging = %name, "no runtime left to drop abandoned staging table");
            return;
        };
        let store = self.store.clone();
        runtime.spawn(async move {
            match store.drop_staging(&name).await {
                Ok(()) => debug!(staging = %name, "dropped abandoned staging table"),
                Err(err) => warn!(staging = %name, error = %err, "failed to drop abandoned staging table"),
            }
        });
    }
}

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying registry migrations")
}

#[derive(Debug, Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn create_staging(&self, name: &str) -> Result<(), PipelineError> {
        let name = checked_staging_name(name)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE UNLOGGED TABLE {name} (
                ordinal BIGSERIAL,
                identifier TEXT NOT NULL,
                display_locale TEXT,
                is_active BOOLEAN NOT NULL,
                search_phrase TEXT NOT NULL,
                locale TEXT NOT NULL,
                setting_name TEXT NOT NULL,
                setting_value TEXT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_staging(&self, name: &str, rows: &[StagingRow]) -> Result<(), PipelineError> {
        let name = checked_staging_name(name)?;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {name} (identifier, display_locale, is_active, search_phrase, locale, setting_name, setting_value) "
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.identifier)
                    .push_bind(&row.display_locale)
                    .push_bind(row.is_active)
                    .push_bind(&row.search_phrase)
                    .push_bind(&row.locale)
                    .push_bind(&row.setting_name)
                    .push_bind(&row.setting_value);
            });
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn reconcile_staging(&self, name: &str) -> Result<ReconcileStats, PipelineError> {
        let name = checked_staging_name(name)?;
        let mut tx = self.pool.begin().await?;

        let entries = sqlx::query(&format!(
            r#"
            INSERT INTO registry_entries (identifier, display_locale, is_active, search_phrase)
            SELECT DISTINCT ON (identifier) identifier, display_locale, is_active, search_phrase
              FROM {name}
             ORDER BY identifier, ordinal DESC
            ON CONFLICT (identifier) DO UPDATE
               SET display_locale = EXCLUDED.display_locale,
                   is_active = EXCLUDED.is_active,
                   search_phrase = EXCLUDED.search_phrase,
                   updated_at = NOW()
             WHERE (registry_entries.display_locale, registry_entries.is_active, registry_entries.search_phrase)
                   IS DISTINCT FROM (EXCLUDED.display_locale, EXCLUDED.is_active, EXCLUDED.search_phrase)
            "#
        ))
        .execute(&mut *tx)
        .await?;

        let pruned = sqlx::query(&format!(
            r#"
            DELETE FROM registry_entry_settings s
             WHERE s.identifier IN (SELECT DISTINCT identifier FROM {name})
               AND NOT EXISTS (
                   SELECT 1
                     FROM {name} st
                    WHERE st.identifier = s.identifier
                      AND st.locale = s.locale
                      AND st.setting_name = s.setting_name
               )
            "#
        ))
        .execute(&mut *tx)
        .await?;

        let settings = sqlx::query(&format!(
            r#"
            INSERT INTO registry_entry_settings (identifier, locale, setting_name, setting_value)
            SELECT DISTINCT ON (identifier, locale, setting_name)
                   identifier, locale, setting_name, setting_value
              FROM {name}
             ORDER BY identifier, locale, setting_name, ordinal DESC
            ON CONFLICT (identifier, locale, setting_name) DO UPDATE
               SET setting_value = EXCLUDED.setting_value,
                   updated_at = NOW()
             WHERE registry_entry_settings.setting_value IS DISTINCT FROM EXCLUDED.setting_value
            "#
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReconcileStats {
            entries_changed: entries.rows_affected(),
            settings_pruned: pruned.rows_affected(),
            settings_changed: settings.rows_affected(),
        })
    }

    async fn drop_staging(&self, name: &str) -> Result<(), PipelineError> {
        let name = checked_staging_name(name)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn counts(&self) -> Result<RegistryCounts, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM registry_entries) AS entries,
                   (SELECT COUNT(*) FROM registry_entry_settings) AS settings
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let entries: i64 = row.try_get("entries")?;
        let settings: i64 = row.try_get("settings")?;
        Ok(RegistryCounts {
            entries: entries as u64,
            settings: settings as u64,
        })
    }
}

type SettingKey = (String, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, RegistryEntry>,
    settings: BTreeMap<SettingKey, String>,
    staging: HashMap<String, Vec<StagingRow>>,
}

/// In-process store with the same reconcile semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    state: Mutex<MemoryState>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.with_state(|state| state.entries.values().cloned().collect())
    }

    pub fn entry(&self, identifier: &str) -> Option<RegistryEntry> {
        self.with_state(|state| state.entries.get(identifier).cloned())
    }

    pub fn settings(&self) -> Vec<RegistryEntrySetting> {
        self.with_state(|state| {
            state
                .settings
                .iter()
                .map(|((identifier, locale, setting_name), value)| RegistryEntrySetting {
                    identifier: identifier.clone(),
                    locale: locale.clone(),
                    setting_name: setting_name.clone(),
                    setting_value: value.clone(),
                })
                .collect()
        })
    }

    pub fn settings_for(&self, identifier: &str) -> Vec<RegistryEntrySetting> {
        self.settings()
            .into_iter()
            .filter(|s| s.identifier == identifier)
            .collect()
    }

    pub fn staging_tables(&self) -> Vec<String> {
        self.with_state(|state| {
            let mut names: Vec<String> = state.staging.keys().cloned().collect();
            names.sort();
            names
        })
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn create_staging(&self, name: &str) -> Result<(), PipelineError> {
        let name = checked_staging_name(name)?;
        self.with_state(|state| state.staging.insert(name.to_string(), Vec::new()));
        Ok(())
    }

    async fn insert_staging(&self, name: &str, rows: &[StagingRow]) -> Result<(), PipelineError> {
        self.with_state(|state| match state.staging.get_mut(name) {
            Some(staged) => {
                staged.extend_from_slice(rows);
                Ok(())
            }
            None => Err(PipelineError::Staging(format!("{name} does not exist"))),
        })
    }

    async fn reconcile_staging(&self, name: &str) -> Result<ReconcileStats, PipelineError> {
        self.with_state(|state| {
            let rows = state
                .staging
                .get(name)
                .cloned()
                .ok_or_else(|| PipelineError::Staging(format!("{name} does not exist")))?;
            let mut stats = ReconcileStats::default();

            let mut latest_entries: BTreeMap<&str, RegistryEntry> = BTreeMap::new();
            let mut wanted: BTreeMap<SettingKey, &str> = BTreeMap::new();
            for row in &rows {
                latest_entries.insert(&row.identifier, row.entry());
                wanted.insert(
                    (row.identifier.clone(), row.locale.clone(), row.setting_name.clone()),
                    &row.setting_value,
                );
            }

            for (identifier, entry) in latest_entries.iter() {
                if state.entries.get(*identifier) != Some(entry) {
                    state.entries.insert(identifier.to_string(), entry.clone());
                    stats.entries_changed += 1;
                }
            }

            let staged_ids: BTreeSet<&str> = latest_entries.keys().copied().collect();
            state.settings.retain(|key, _| {
                let orphan = staged_ids.contains(key.0.as_str()) && !wanted.contains_key(key);
                if orphan {
                    stats.settings_pruned += 1;
                }
                !orphan
            });

            for (key, value) in wanted {
                if state.settings.get(&key).map(String::as_str) != Some(value) {
                    state.settings.insert(key, value.to_string());
                    stats.settings_changed += 1;
                }
            }
            Ok(stats)
        })
    }

    async fn drop_staging(&self, name: &str) -> Result<(), PipelineError> {
        self.with_state(|state| state.staging.remove(name));
        Ok(())
    }

    async fn counts(&self) -> Result<RegistryCounts, PipelineError> {
        Ok(self.with_state(|state| RegistryCounts {
            entries: state.entries.len() as u64,
            settings: state.settings.len() as u64,
        }))
    }
}
