//! Storage abstraction over credential and config state.
//!
//! Three backends implement [`Storage`], selected by environment:
//! PostgreSQL (`POSTGRES_DSN`), Valkey/Redis (`VALKEY_URL`/`REDIS_URL`),
//! and a JSON file store rooted at `CREDENTIALS_DIR` when no database is
//! configured.
//!
//! The trait surface is deliberately infallible: backend errors are logged
//! inside the adapter and mapped to the safe empty value (`None`, `Vec::new`,
//! `false`). Nothing above this layer handles storage failures.

mod file;
mod postgres;
mod valkey;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::models::{
    CredentialState, CredentialStats, CredentialSummary, CredentialsSummary, EnabledCredential,
    StateUpdate,
};

pub use file::FileStorage;
pub use postgres::PostgresStorage;
pub use valkey::ValkeyStorage;

/// Credential namespace. The antigravity namespace is a parallel table/key
/// prefix served under its own route prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Standard,
    Antigravity,
}

impl Namespace {
    /// SQL table for this namespace.
    pub fn table(self) -> &'static str {
        match self {
            Namespace::Standard => "credentials",
            Namespace::Antigravity => "antigravity_credentials",
        }
    }

    /// Hash key prefix for this namespace.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Namespace::Standard => "gcli:creds:",
            Namespace::Antigravity => "gcli:ag_creds:",
        }
    }

    /// Index set listing the namespace's member filenames.
    pub fn index_key(self) -> &'static str {
        match self {
            Namespace::Standard => "gcli:creds_index",
            Namespace::Antigravity => "gcli:ag_creds_index",
        }
    }
}

/// Filters for the credentials summary listing.
#[derive(Debug, Clone, Default)]
pub struct SummaryQuery {
    pub offset: usize,
    pub limit: Option<usize>,
    /// `all` (default), `enabled`, or `disabled`.
    pub status_filter: Option<String>,
    /// Match a specific recorded error code, e.g. `"429"`.
    pub error_code_filter: Option<String>,
    /// `in_cooldown` or `no_cooldown`.
    pub cooldown_filter: Option<String>,
}

/// Seconds since the Unix epoch, as the storage layer stores timestamps.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store or update a credential. Returns `false` (without writing) when
    /// another record in the namespace already carries the same
    /// `refresh_token`, or on backend error.
    async fn store_credential(&self, ns: Namespace, filename: &str, data: &Value) -> bool;

    async fn get_credential(&self, ns: Namespace, filename: &str) -> Option<Value>;

    async fn list_credentials(&self, ns: Namespace) -> Vec<String>;

    async fn delete_credential(&self, ns: Namespace, filename: &str) -> bool;

    /// Enabled (non-disabled) records with their active cooldowns, for pool
    /// selection. Order is unspecified; the pool shuffles.
    async fn get_enabled_credentials(&self, ns: Namespace) -> Vec<EnabledCredential>;

    async fn get_credential_state(&self, ns: Namespace, filename: &str) -> CredentialState;

    async fn update_credential_state(
        &self,
        ns: Namespace,
        filename: &str,
        update: StateUpdate,
    ) -> bool;

    async fn get_all_credential_states(&self, ns: Namespace) -> HashMap<String, CredentialState>;

    /// Set (or clear, with `None`) the per-model cooldown deadline.
    async fn set_model_cooldown(
        &self,
        ns: Namespace,
        filename: &str,
        model_key: &str,
        cooldown_until: Option<f64>,
    ) -> bool;

    /// Best-effort increment of the per-credential call counter.
    async fn increment_call_count(&self, ns: Namespace, filename: &str) -> bool;

    /// Paged, filtered summary of the namespace.
    async fn get_credentials_summary(&self, ns: Namespace, query: &SummaryQuery)
        -> CredentialsSummary;

    /// Config is served from an in-memory cache loaded at init.
    async fn get_config(&self, key: &str) -> Option<Value>;

    /// Write-through: persists and updates the cache.
    async fn set_config(&self, key: &str, value: Value) -> bool;

    async fn delete_config(&self, key: &str) -> bool;

    async fn get_all_config(&self) -> HashMap<String, Value>;

    /// Replace the config cache with the persisted state.
    async fn reload_config_cache(&self);
}

/// Store every credential in the map; returns how many were stored
/// (duplicates and failures are skipped).
pub async fn batch_store_credentials(
    storage: &dyn Storage,
    ns: Namespace,
    credentials: &HashMap<String, Value>,
) -> usize {
    let mut stored = 0;
    for (filename, data) in credentials {
        if storage.store_credential(ns, filename, data).await {
            stored += 1;
        }
    }
    stored
}

/// Select and initialize the storage backend for this deployment.
pub async fn init_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    if let Some(dsn) = &config.postgres_dsn {
        let storage = PostgresStorage::connect(dsn).await?;
        tracing::info!("PostgreSQL storage initialized");
        return Ok(Arc::new(storage));
    }
    if let Some(url) = &config.valkey_url {
        let storage = ValkeyStorage::connect(url).await?;
        tracing::info!("Valkey/Redis storage initialized");
        return Ok(Arc::new(storage));
    }
    let storage = FileStorage::open(&config.credentials_dir).await?;
    tracing::info!(
        dir = %config.credentials_dir.display(),
        "file storage initialized"
    );
    Ok(Arc::new(storage))
}

/// Apply the summary filters, pagination, and global stats over the full
/// row set of a namespace. Shared by all backends.
pub(crate) fn build_summary(
    mut rows: Vec<CredentialSummary>,
    query: &SummaryQuery,
) -> CredentialsSummary {
    let now = epoch_now();
    rows.sort_by_key(|r| r.rotation_order);

    let mut stats = CredentialStats {
        total: rows.len(),
        ..Default::default()
    };
    for row in &rows {
        if row.disabled {
            stats.disabled += 1;
        } else {
            stats.normal += 1;
        }
    }

    let status = query.status_filter.as_deref().unwrap_or("all");
    let error_filter = query
        .error_code_filter
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case("all"));

    let filtered: Vec<CredentialSummary> = rows
        .into_iter()
        .filter(|row| match status {
            "enabled" => !row.disabled,
            "disabled" => row.disabled,
            _ => true,
        })
        .filter(|row| {
            let Some(filter) = error_filter else {
                return true;
            };
            let as_int: Option<i64> = filter.parse().ok();
            row.error_codes
                .iter()
                .any(|code| Some(*code) == as_int || code.to_string() == filter)
        })
        .map(|mut row| {
            row.model_cooldowns.retain(|_, until| *until > now);
            row
        })
        .filter(|row| match query.cooldown_filter.as_deref() {
            Some("in_cooldown") => !row.model_cooldowns.is_empty(),
            Some("no_cooldown") => row.model_cooldowns.is_empty(),
            _ => true,
        })
        .collect();

    let total = filtered.len();
    let items: Vec<CredentialSummary> = match query.limit {
        Some(limit) => filtered.into_iter().skip(query.offset).take(limit).collect(),
        None => filtered.into_iter().skip(query.offset).collect(),
    };

    CredentialsSummary {
        items,
        total,
        offset: query.offset,
        limit: query.limit,
        stats,
    }
}

/// Extract the refresh token out of a credential bundle.
pub(crate) fn refresh_token_of(data: &Value) -> Option<&str> {
    data.get("refresh_token")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
}

/// Apply a partial update onto a state record.
pub(crate) fn apply_state_update(state: &mut CredentialState, update: StateUpdate) {
    if let Some(disabled) = update.disabled {
        state.disabled = disabled;
    }
    if let Some(codes) = update.error_codes {
        state.error_codes = codes;
    }
    if let Some(ts) = update.last_success {
        state.last_success = Some(ts);
    }
    if let Some(email) = update.user_email {
        state.user_email = email;
    }
    if let Some(cooldowns) = update.model_cooldowns {
        state.model_cooldowns = cooldowns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(filename: &str, disabled: bool, codes: Vec<i64>, order: i64) -> CredentialSummary {
        CredentialSummary {
            filename: filename.to_string(),
            disabled,
            error_codes: codes,
            last_success: None,
            user_email: None,
            rotation_order: order,
            call_count: 0,
            model_cooldowns: HashMap::new(),
        }
    }

    #[test]
    fn summary_counts_and_sorts_by_rotation_order() {
        let rows = vec![
            row("b", true, vec![], 1),
            row("a", false, vec![], 0),
            row("c", false, vec![], 2),
        ];
        let out = build_summary(rows, &SummaryQuery::default());
        assert_eq!(out.stats.total, 3);
        assert_eq!(out.stats.normal, 2);
        assert_eq!(out.stats.disabled, 1);
        assert_eq!(out.items[0].filename, "a");
        assert_eq!(out.items[1].filename, "b");
    }

    #[test]
    fn summary_status_filter() {
        let rows = vec![row("a", false, vec![], 0), row("b", true, vec![], 1)];
        let q = SummaryQuery {
            status_filter: Some("disabled".to_string()),
            ..Default::default()
        };
        let out = build_summary(rows, &q);
        assert_eq!(out.total, 1);
        assert_eq!(out.items[0].filename, "b");
    }

    #[test]
    fn summary_error_code_filter_matches_numeric_string() {
        let rows = vec![
            row("a", false, vec![429, 500], 0),
            row("b", false, vec![403], 1),
        ];
        let q = SummaryQuery {
            error_code_filter: Some("429".to_string()),
            ..Default::default()
        };
        let out = build_summary(rows, &q);
        assert_eq!(out.total, 1);
        assert_eq!(out.items[0].filename, "a");
    }

    #[test]
    fn summary_cooldown_filter_drops_expired_entries() {
        let mut hot = row("hot", false, vec![], 0);
        hot.model_cooldowns
            .insert("gemini-2.5-pro".to_string(), epoch_now() + 60.0);
        let mut stale = row("stale", false, vec![], 1);
        stale
            .model_cooldowns
            .insert("gemini-2.5-pro".to_string(), epoch_now() - 60.0);

        let q = SummaryQuery {
            cooldown_filter: Some("in_cooldown".to_string()),
            ..Default::default()
        };
        let out = build_summary(vec![hot, stale], &q);
        assert_eq!(out.total, 1);
        assert_eq!(out.items[0].filename, "hot");
    }

    #[test]
    fn summary_pagination() {
        let rows = (0..5).map(|i| row(&format!("c{i}"), false, vec![], i)).collect();
        let q = SummaryQuery {
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let out = build_summary(rows, &q);
        assert_eq!(out.total, 5);
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.items[0].filename, "c1");
    }
}
