//! Valkey/Redis storage backend.
//!
//! Each credential is a hash at `gcli:creds:<filename>` (antigravity:
//! `gcli:ag_creds:<filename>`) with every field JSON-encoded; an index set
//! holds the member filenames. Config lives in a single `gcli:config` hash,
//! cached in memory and written through.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::models::{
    CredentialState, CredentialSummary, CredentialsSummary, EnabledCredential, StateUpdate,
};

use super::{build_summary, epoch_now, refresh_token_of, Namespace, Storage, SummaryQuery};

const KEY_CONFIG: &str = "gcli:config";

/// Hash fields that hold gateway-managed state rather than the token bundle.
const STATE_FIELDS: &[&str] = &[
    "disabled",
    "error_codes",
    "last_success",
    "user_email",
    "model_cooldowns",
    "rotation_order",
    "call_count",
];

pub struct ValkeyStorage {
    conn: ConnectionManager,
    config_cache: RwLock<HashMap<String, Value>>,
}

impl ValkeyStorage {
    /// Connect, ping, and prime the config cache.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        let storage = Self {
            conn,
            config_cache: RwLock::new(HashMap::new()),
        };
        storage.load_config_cache().await?;
        Ok(storage)
    }

    async fn load_config_cache(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(KEY_CONFIG).await?;
        let cache = raw
            .into_iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(&v).unwrap_or(Value::String(v));
                (k, value)
            })
            .collect();
        *self.config_cache.write().await = cache;
        Ok(())
    }

    fn credential_key(ns: Namespace, filename: &str) -> String {
        format!("{}{}", ns.key_prefix(), filename)
    }

    /// Decode a stored hash back into a credential record: every field was
    /// JSON-encoded on write; values that fail to parse are kept as strings.
    fn parse_hash(raw: HashMap<String, String>) -> HashMap<String, Value> {
        raw.into_iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(&v).unwrap_or(Value::String(v));
                (k, value)
            })
            .collect()
    }

    fn state_from_fields(fields: &HashMap<String, Value>) -> CredentialState {
        CredentialState {
            disabled: fields
                .get("disabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            error_codes: fields
                .get("error_codes")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            last_success: fields.get("last_success").and_then(|v| v.as_f64()),
            user_email: fields
                .get("user_email")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            model_cooldowns: fields
                .get("model_cooldowns")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
        }
    }

    /// The token bundle is whatever is left after removing state fields.
    fn bundle_from_fields(fields: &HashMap<String, Value>) -> Value {
        let mut map = serde_json::Map::new();
        for (k, v) in fields {
            if !STATE_FIELDS.contains(&k.as_str()) {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Object(map)
    }

    async fn fetch_all(&self, ns: Namespace) -> anyhow::Result<HashMap<String, HashMap<String, Value>>> {
        let mut conn = self.conn.clone();
        let filenames: Vec<String> = conn.smembers(ns.index_key()).await?;
        let mut out = HashMap::with_capacity(filenames.len());
        for filename in filenames {
            let raw: HashMap<String, String> =
                conn.hgetall(Self::credential_key(ns, &filename)).await?;
            if !raw.is_empty() {
                out.insert(filename, Self::parse_hash(raw));
            }
        }
        Ok(out)
    }

    async fn write_state_fields(
        &self,
        ns: Namespace,
        filename: &str,
        updates: Vec<(&'static str, Value)>,
    ) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let encoded: Vec<(&'static str, String)> = updates
            .into_iter()
            .map(|(field, value)| (field, value.to_string()))
            .collect();
        let () = conn
            .hset_multiple(Self::credential_key(ns, filename), &encoded)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for ValkeyStorage {
    async fn store_credential(&self, ns: Namespace, filename: &str, data: &Value) -> bool {
        let result: anyhow::Result<bool> = async {
            let mut conn = self.conn.clone();

            if let Some(token) = refresh_token_of(data) {
                let existing: Vec<String> = conn.smembers(ns.index_key()).await?;
                for other in existing {
                    if other == filename {
                        continue;
                    }
                    let stored: Option<String> = conn
                        .hget(Self::credential_key(ns, &other), "refresh_token")
                        .await?;
                    let Some(stored) = stored else { continue };
                    let stored_token = serde_json::from_str::<Value>(&stored)
                        .ok()
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or(stored);
                    if stored_token == token {
                        tracing::debug!(filename, existing = %other, "skipped duplicate refresh_token");
                        return Ok(false);
                    }
                }
            }

            let key = Self::credential_key(ns, filename);
            let Some(obj) = data.as_object() else {
                tracing::error!(filename, "credential bundle is not a JSON object");
                return Ok(false);
            };
            let fields: Vec<(String, String)> = obj
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect();
            let () = conn.hset_multiple(&key, &fields).await?;

            let is_new: bool = conn.sadd(ns.index_key(), filename).await?;
            if is_new {
                let order: i64 = conn.scard(ns.index_key()).await?;
                let state_fields = vec![
                    ("rotation_order", Value::from(order - 1)),
                    ("last_success", Value::from(epoch_now())),
                ];
                self.write_state_fields(ns, filename, state_fields).await?;
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
            let mut conn = self.conn.clone();
            let raw: HashMap<String, String> =
                conn.hgetall(Self::credential_key(ns, filename)).await?;
            if raw.is_empty() {
                return Ok(None);
            }
            Ok(Some(Self::bundle_from_fields(&Self::parse_hash(raw))))
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error getting credential");
            None
        })
    }

    async fn list_credentials(&self, ns: Namespace) -> Vec<String> {
        let result: anyhow::Result<Vec<String>> = async {
            let mut conn = self.conn.clone();
            let mut names: Vec<String> = conn.smembers(ns.index_key()).await?;
            names.sort();
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
            let mut conn = self.conn.clone();
            let removed: i64 = conn.del(Self::credential_key(ns, filename)).await?;
            let () = conn.srem(ns.index_key(), filename).await?;
            tracing::debug!(filename, "deleted credential");
            Ok(removed > 0)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error deleting credential");
            false
        })
    }

    async fn get_enabled_credentials(&self, ns: Namespace) -> Vec<EnabledCredential> {
        let result: anyhow::Result<Vec<EnabledCredential>> = async {
            let all = self.fetch_all(ns).await?;
            let now = epoch_now();
            let mut out = Vec::new();
            for (filename, fields) in all {
                let mut state = Self::state_from_fields(&fields);
                if state.disabled {
                    continue;
                }
                state.prune_cooldowns(now);
                out.push(EnabledCredential {
                    filename,
                    credential_data: Self::bundle_from_fields(&fields),
                    model_cooldowns: state.model_cooldowns,
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
            let mut conn = self.conn.clone();
            let raw: HashMap<String, String> =
                conn.hgetall(Self::credential_key(ns, filename)).await?;
            if raw.is_empty() {
                return Ok(CredentialState::default());
            }
            Ok(Self::state_from_fields(&Self::parse_hash(raw)))
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
        let result: anyhow::Result<bool> = async {
            let mut updates: Vec<(&'static str, Value)> = Vec::new();
            if let Some(disabled) = update.disabled {
                updates.push(("disabled", Value::from(disabled)));
            }
            if let Some(codes) = update.error_codes {
                updates.push(("error_codes", serde_json::json!(codes)));
            }
            if let Some(ts) = update.last_success {
                updates.push(("last_success", Value::from(ts)));
            }
            if let Some(email) = update.user_email {
                updates.push(("user_email", serde_json::json!(email)));
            }
            if let Some(cooldowns) = update.model_cooldowns {
                updates.push(("model_cooldowns", serde_json::json!(cooldowns)));
            }
            self.write_state_fields(ns, filename, updates).await?;
            Ok(true)
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(filename, error = %e, "error updating credential state");
            false
        })
    }

    async fn get_all_credential_states(&self, ns: Namespace) -> HashMap<String, CredentialState> {
        let result: anyhow::Result<HashMap<String, CredentialState>> = async {
            let all = self.fetch_all(ns).await?;
            let now = epoch_now();
            Ok(all
                .into_iter()
                .map(|(filename, fields)| {
                    let mut state = Self::state_from_fields(&fields);
                    state.prune_cooldowns(now);
                    (filename, state)
                })
                .collect())
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
        let result: anyhow::Result<bool> = async {
            let mut conn = self.conn.clone();
            let is_member: bool = conn.sismember(ns.index_key(), filename).await?;
            if !is_member {
                tracing::warn!(filename, "credential not found for cooldown update");
                return Ok(false);
            }
            let mut state = self.get_credential_state(ns, filename).await;
            match cooldown_until {
                Some(until) => {
                    state.model_cooldowns.insert(model_key.to_string(), until);
                }
                None => {
                    state.model_cooldowns.remove(model_key);
                }
            }
            self.write_state_fields(
                ns,
                filename,
                vec![("model_cooldowns", serde_json::json!(state.model_cooldowns))],
            )
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
            let mut conn = self.conn.clone();
            let current: Option<String> = conn
                .hget(Self::credential_key(ns, filename), "call_count")
                .await?;
            let count = current
                .and_then(|v| serde_json::from_str::<i64>(&v).ok())
                .unwrap_or(0);
            self.write_state_fields(ns, filename, vec![("call_count", Value::from(count + 1))])
                .await?;
            Ok(true)
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
            let all = self.fetch_all(ns).await?;
            Ok(all
                .into_iter()
                .map(|(filename, fields)| {
                    let state = Self::state_from_fields(&fields);
                    CredentialSummary {
                        filename,
                        disabled: state.disabled,
                        error_codes: state.error_codes,
                        last_success: state.last_success,
                        user_email: state.user_email,
                        rotation_order: fields
                            .get("rotation_order")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0),
                        call_count: fields
                            .get("call_count")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0),
                        model_cooldowns: state.model_cooldowns,
                    }
                })
                .collect())
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
            let mut conn = self.conn.clone();
            let () = conn.hset(KEY_CONFIG, key, value.to_string()).await?;
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
            let mut conn = self.conn.clone();
            let () = conn.hdel(KEY_CONFIG, key).await?;
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
            tracing::info!("config cache reloaded");
        }
    }
}
