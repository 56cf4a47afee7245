//! PostgreSQL storage backend.
//!
//! One table per credential namespace plus a config table. Credential
//! bundles and the mutable JSON fields (`error_codes`, `model_cooldowns`)
//! are JSONB columns; refresh-token dedup runs as a JSONB path query at
//! insert time. Dynamic config is cached in memory and written through.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::models::{
    CredentialState, CredentialSummary, CredentialsSummary, EnabledCredential, StateUpdate,
};

use super::{build_summary, epoch_now, refresh_token_of, Namespace, Storage, SummaryQuery};

const CREATE_CREDENTIALS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS {table} (
        id SERIAL PRIMARY KEY,
        filename TEXT UNIQUE NOT NULL,
        credential_data JSONB NOT NULL,
        disabled BOOLEAN DEFAULT FALSE,
        error_codes JSONB DEFAULT '[]'::jsonb,
        last_success DOUBLE PRECISION,
        user_email TEXT,
        model_cooldowns JSONB DEFAULT '{}'::jsonb,
        rotation_order INTEGER DEFAULT 0,
        call_count INTEGER DEFAULT 0,
        created_at DOUBLE PRECISION DEFAULT EXTRACT(EPOCH FROM NOW()),
        updated_at DOUBLE PRECISION DEFAULT EXTRACT(EPOCH FROM NOW())
    )
"#;

const CREATE_CONFIG_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value JSONB NOT NULL,
        updated_at DOUBLE PRECISION DEFAULT EXTRACT(EPOCH FROM NOW())
    )
"#;

pub struct PostgresStorage {
    pool: PgPool,
    config_cache: RwLock<HashMap<String, Value>>,
}

impl PostgresStorage {
    /// Connect, create tables if missing, and prime the config cache.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(60))
            .connect(dsn)
            .await?;

        for ns in [Namespace::Standard, Namespace::Antigravity] {
            sqlx::query(&CREATE_CREDENTIALS_TABLE.replace("{table}", ns.table()))
                .execute(&pool)
                .await?;
        }
        sqlx::query(CREATE_CONFIG_TABLE).execute(&pool).await?;
        for (name, column) in [
            ("idx_cred_disabled", "credentials(disabled)"),
            ("idx_cred_rotation", "credentials(rotation_order)"),
            ("idx_ag_disabled", "antigravity_credentials(disabled)"),
            ("idx_ag_rotation", "antigravity_credentials(rotation_order)"),
        ] {
            sqlx::query(&format!("CREATE INDEX IF NOT EXISTS {name} ON {column}"))
                .execute(&pool)
                .await?;
        }

        let storage = Self {
            pool,
            config_cache: RwLock::new(HashMap::new()),
        };
        storage.load_config_cache().await?;
        Ok(storage)
    }

    async fn load_config_cache(&self) -> anyhow::Result<()> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        let mut cache = HashMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: Value = row.try_get("value")?;
            cache.insert(key, value);
        }
        tracing::debug!(items = cache.len(), "loaded config cache");
        *self.config_cache.write().await = cache;
        Ok(())
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> CredentialState {
        CredentialState {
            disabled: row.try_get("disabled").unwrap_or(false),
            error_codes: row
                .try_get::<Value, _>("error_codes")
                .ok()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            last_success: row.try_get("last_success").unwrap_or(None),
            user_email: row.try_get("user_email").unwrap_or(None),
            model_cooldowns: row
                .try_get::<Value, _>("model_cooldowns")
                .ok()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn store_credential(&self, ns: Namespace, filename: &str, data: &Value) -> bool {
        let table = ns.table();
        let result: anyhow::Result<bool> = async {
            if let Some(token) = refresh_token_of(data) {
                let dup: Option<String> = sqlx::query_scalar(&format!(
                    "SELECT filename FROM {table} WHERE credential_data->>'refresh_token' = $1"
                ))
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
                if let Some(existing) = dup {
                    if existing != filename {
                        tracing::debug!(filename, existing = %existing, "skipped duplicate refresh_token");
                        return Ok(false);
                    }
                }
            }

            let now = epoch_now();
            let exists: Option<i32> =
                sqlx::query_scalar(&format!("SELECT id FROM {table} WHERE filename = $1"))
                    .bind(filename)
                    .fetch_optional(&self.pool)
                    .await?;

            if exists.is_some() {
                sqlx::query(&format!(
                    "UPDATE {table} SET credential_data = $1, updated_at = $2 WHERE filename = $3"
                ))
                .bind(data)
                .bind(now)
                .bind(filename)
                .execute(&self.pool)
                .await?;
            } else {
                let next_order: i32 = sqlx::query_scalar(&format!(
                    "SELECT COALESCE(MAX(rotation_order), -1) + 1 FROM {table}"
                ))
                .fetch_one(&self.pool)
                .await?;
                sqlx::query(&format!(
                    "INSERT INTO {table} \
                     (filename, credential_data, rotation_order, last_success, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $5)"
                ))
                .bind(filename)
                .bind(data)
                .bind(next_order)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            tracing::debug!(filename, "stored credential");
            Ok(true)
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error storing credential");
            false
        })
    }

    async fn get_credential(&self, ns: Namespace, filename: &str) -> Option<Value> {
        let result: anyhow::Result<Option<Value>> = async {
            let data: Option<Value> = sqlx::query_scalar(&format!(
                "SELECT credential_data FROM {} WHERE filename = $1",
                ns.table()
            ))
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
            Ok(data)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error getting credential");
            None
        })
    }

    async fn list_credentials(&self, ns: Namespace) -> Vec<String> {
        let result: anyhow::Result<Vec<String>> = async {
            let names: Vec<String> = sqlx::query_scalar(&format!(
                "SELECT filename FROM {} ORDER BY rotation_order",
                ns.table()
            ))
            .fetch_all(&self.pool)
            .await?;
            Ok(names)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "error listing credentials");
            Vec::new()
        })
    }

    async fn delete_credential(&self, ns: Namespace, filename: &str) -> bool {
        let result: anyhow::Result<bool> = async {
            let done = sqlx::query(&format!("DELETE FROM {} WHERE filename = $1", ns.table()))
                .bind(filename)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected() > 0)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error deleting credential");
            false
        })
    }

    async fn get_enabled_credentials(&self, ns: Namespace) -> Vec<EnabledCredential> {
        let result: anyhow::Result<Vec<EnabledCredential>> = async {
            let rows = sqlx::query(&format!(
                "SELECT filename, credential_data, model_cooldowns FROM {} WHERE disabled = FALSE",
                ns.table()
            ))
            .fetch_all(&self.pool)
            .await?;
            let now = epoch_now();
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let mut cooldowns: HashMap<String, f64> = row
                    .try_get::<Value, _>("model_cooldowns")
                    .ok()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                cooldowns.retain(|_, until| *until > now);
                out.push(EnabledCredential {
                    filename: row.try_get("filename")?,
                    credential_data: row.try_get("credential_data")?,
                    model_cooldowns: cooldowns,
                });
            }
            Ok(out)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "error getting enabled credentials");
            Vec::new()
        })
    }

    async fn get_credential_state(&self, ns: Namespace, filename: &str) -> CredentialState {
        let result: anyhow::Result<CredentialState> = async {
            let row = sqlx::query(&format!(
                "SELECT disabled, error_codes, last_success, user_email, model_cooldowns \
                 FROM {} WHERE filename = $1",
                ns.table()
            ))
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.as_ref().map(Self::row_to_state).unwrap_or_default())
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error getting credential state");
            CredentialState::default()
        })
    }

    async fn update_credential_state(
        &self,
        ns: Namespace,
        filename: &str,
        update: StateUpdate,
    ) -> bool {
        let table = ns.table();
        let result: anyhow::Result<bool> = async {
            let mut set_clauses: Vec<String> = Vec::new();
            let mut idx = 1u32;
            // Build SET list first so the bind order below matches.
            let mut clause = |column: &str, cast: &str| {
                set_clauses.push(format!("{column} = ${idx}{cast}"));
                idx += 1;
            };
            if update.disabled.is_some() {
                clause("disabled", "");
            }
            if update.error_codes.is_some() {
                clause("error_codes", "::jsonb");
            }
            if update.last_success.is_some() {
                clause("last_success", "");
            }
            if update.user_email.is_some() {
                clause("user_email", "");
            }
            if update.model_cooldowns.is_some() {
                clause("model_cooldowns", "::jsonb");
            }
            if set_clauses.is_empty() {
                return Ok(true);
            }
            set_clauses.push(format!("updated_at = ${idx}"));
            let filename_idx = idx + 1;

            let sql = format!(
                "UPDATE {table} SET {} WHERE filename = ${filename_idx}",
                set_clauses.join(", ")
            );
            let mut q = sqlx::query(&sql);
            if let Some(disabled) = update.disabled {
                q = q.bind(disabled);
            }
            if let Some(codes) = &update.error_codes {
                q = q.bind(serde_json::json!(codes));
            }
            if let Some(ts) = update.last_success {
                q = q.bind(ts);
            }
            if let Some(email) = &update.user_email {
                q = q.bind(email.clone());
            }
            if let Some(cooldowns) = &update.model_cooldowns {
                q = q.bind(serde_json::json!(cooldowns));
            }
            let done = q.bind(epoch_now()).bind(filename).execute(&self.pool).await?;
            Ok(done.rows_affected() > 0)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error updating credential state");
            false
        })
    }

    async fn get_all_credential_states(&self, ns: Namespace) -> HashMap<String, CredentialState> {
        let result: anyhow::Result<HashMap<String, CredentialState>> = async {
            let rows = sqlx::query(&format!(
                "SELECT filename, disabled, error_codes, last_success, user_email, model_cooldowns \
                 FROM {}",
                ns.table()
            ))
            .fetch_all(&self.pool)
            .await?;
            let now = epoch_now();
            let mut out = HashMap::with_capacity(rows.len());
            for row in rows {
                let filename: String = row.try_get("filename")?;
                let mut state = Self::row_to_state(&row);
                state.prune_cooldowns(now);
                out.insert(filename, state);
            }
            Ok(out)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "error getting credential states");
            HashMap::new()
        })
    }

    async fn set_model_cooldown(
        &self,
        ns: Namespace,
        filename: &str,
        model_key: &str,
        cooldown_until: Option<f64>,
    ) -> bool {
        let table = ns.table();
        let result: anyhow::Result<bool> = async {
            let current: Option<Value> = sqlx::query_scalar(&format!(
                "SELECT model_cooldowns FROM {table} WHERE filename = $1"
            ))
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
            let Some(current) = current else {
                tracing::warn!(filename, "credential not found for cooldown update");
                return Ok(false);
            };

            let mut cooldowns: HashMap<String, f64> =
                serde_json::from_value(current).unwrap_or_default();
            match cooldown_until {
                Some(until) => {
                    cooldowns.insert(model_key.to_string(), until);
                }
                None => {
                    cooldowns.remove(model_key);
                }
            }

            sqlx::query(&format!(
                "UPDATE {table} SET model_cooldowns = $1::jsonb, updated_at = $2 WHERE filename = $3"
            ))
            .bind(serde_json::json!(cooldowns))
            .bind(epoch_now())
            .bind(filename)
            .execute(&self.pool)
            .await?;
            tracing::debug!(filename, model_key, "set model cooldown");
            Ok(true)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error setting model cooldown");
            false
        })
    }

    async fn increment_call_count(&self, ns: Namespace, filename: &str) -> bool {
        let result: anyhow::Result<bool> = async {
            let done = sqlx::query(&format!(
                "UPDATE {} SET call_count = call_count + 1 WHERE filename = $1",
                ns.table()
            ))
            .bind(filename)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() > 0)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error incrementing call count");
            false
        })
    }

    async fn get_credentials_summary(
        &self,
        ns: Namespace,
        query: &SummaryQuery,
    ) -> CredentialsSummary {
        let result: anyhow::Result<Vec<CredentialSummary>> = async {
            let rows = sqlx::query(&format!(
                "SELECT filename, disabled, error_codes, last_success, user_email, \
                 rotation_order, call_count, model_cooldowns FROM {}",
                ns.table()
            ))
            .fetch_all(&self.pool)
            .await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let state = Self::row_to_state(&row);
                out.push(CredentialSummary {
                    filename: row.try_get("filename")?,
                    disabled: state.disabled,
                    error_codes: state.error_codes,
                    last_success: state.last_success,
                    user_email: state.user_email,
                    rotation_order: row.try_get::<i32, _>("rotation_order").unwrap_or(0) as i64,
                    call_count: row.try_get::<i32, _>("call_count").unwrap_or(0) as i64,
                    model_cooldowns: state.model_cooldowns,
                });
            }
            Ok(out)
        }
        .await;

        let rows = result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "error getting credentials summary");
            Vec::new()
        });
        build_summary(rows, query)
    }

    async fn get_config(&self, key: &str) -> Option<Value> {
        self.config_cache.read().await.get(key).cloned()
    }

    async fn set_config(&self, key: &str, value: Value) -> bool {
        let result: anyhow::Result<()> = async {
            sqlx::query(
                "INSERT INTO config (key, value, updated_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = $3",
            )
            .bind(key)
            .bind(&value)
            .bind(epoch_now())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.config_cache.write().await.insert(key.to_string(), value);
                true
            }
            Err(e) => {
                tracing::error!(key, error = %e, "error setting config");
                false
            }
        }
    }

    async fn delete_config(&self, key: &str) -> bool {
        let result: anyhow::Result<()> = async {
            sqlx::query("DELETE FROM config WHERE key = $1")
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.config_cache.write().await.remove(key);
                true
            }
            Err(e) => {
                tracing::error!(key, error = %e, "error deleting config");
                false
            }
        }
    }

    async fn get_all_config(&self) -> HashMap<String, Value> {
        self.config_cache.read().await.clone()
    }

    async fn reload_config_cache(&self) {
        if let Err(e) = self.load_config_cache().await {
            tracing::error!(error = %e, "error reloading config cache");
        } else {
            tracing::info!("config cache reloaded from database");
        }
    }
}
