//! File-store backend.
//!
//! Used when neither PostgreSQL nor Valkey is configured. Credential bundles
//! live as individual JSON files under the configured directory (the
//! antigravity namespace in an `antigravity/` subdirectory), so dropping a
//! credential file into the directory is enough to register it. The
//! gateway-managed state sits next to them in `credential_state.json`, and
//! dynamic config in `config.json`; both are written atomically (temp file,
//! then rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::models::{
    CredentialState, CredentialSummary, CredentialsSummary, EnabledCredential, StateUpdate,
};

use super::{
    apply_state_update, build_summary, epoch_now, refresh_token_of, Namespace, Storage,
    SummaryQuery,
};

const STATE_FILE: &str = "credential_state.json";
const CONFIG_FILE: &str = "config.json";

/// Per-credential record persisted in the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(flatten)]
    state: CredentialState,
    #[serde(default)]
    rotation_order: i64,
    #[serde(default)]
    call_count: i64,
}

#[derive(Debug, Default)]
struct NamespaceData {
    credentials: HashMap<String, Value>,
    states: HashMap<String, StoredState>,
}

impl NamespaceData {
    fn next_rotation_order(&self) -> i64 {
        self.states
            .values()
            .map(|s| s.rotation_order)
            .max()
            .map_or(0, |max| max + 1)
    }
}

#[derive(Debug, Default)]
struct FileState {
    standard: NamespaceData,
    antigravity: NamespaceData,
    config: HashMap<String, Value>,
}

impl FileState {
    fn ns(&self, ns: Namespace) -> &NamespaceData {
        match ns {
            Namespace::Standard => &self.standard,
            Namespace::Antigravity => &self.antigravity,
        }
    }

    fn ns_mut(&mut self, ns: Namespace) -> &mut NamespaceData {
        match ns {
            Namespace::Standard => &mut self.standard,
            Namespace::Antigravity => &mut self.antigravity,
        }
    }
}

/// JSON-file storage rooted at `CREDENTIALS_DIR`.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    inner: RwLock<FileState>,
}

impl FileStorage {
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root.join("antigravity"))?;

        let mut state = FileState::default();
        state.standard.credentials = scan_credential_files(root);
        state.antigravity.credentials = scan_credential_files(&root.join("antigravity"));

        let state_path = root.join(STATE_FILE);
        if state_path.exists() {
            match load_state_file(&state_path) {
                Ok((standard, antigravity)) => {
                    state.standard.states = standard;
                    state.antigravity.states = antigravity;
                }
                Err(e) => {
                    tracing::error!(
                        path = %state_path.display(),
                        error = %e,
                        "failed to load credential state, starting fresh"
                    );
                }
            }
        }

        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            match load_json_map(&config_path) {
                Ok(config) => state.config = config,
                Err(e) => {
                    tracing::error!(
                        path = %config_path.display(),
                        error = %e,
                        "failed to load config file, starting empty"
                    );
                }
            }
        }

        // Credentials that arrived as bare files get state records lazily;
        // assign rotation order by discovery so the display sort is stable.
        for ns in [Namespace::Standard, Namespace::Antigravity] {
            let data = state.ns_mut(ns);
            let mut filenames: Vec<String> = data
                .credentials
                .keys()
                .filter(|f| !data.states.contains_key(*f))
                .cloned()
                .collect();
            filenames.sort();
            for filename in filenames {
                let order = data.next_rotation_order();
                data.states.insert(
                    filename,
                    StoredState {
                        rotation_order: order,
                        ..Default::default()
                    },
                );
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            inner: RwLock::new(state),
        })
    }

    fn credential_path(&self, ns: Namespace, filename: &str) -> Option<PathBuf> {
        // Filenames are opaque identifiers, not paths.
        if filename.is_empty() || filename.contains('/') || filename.contains("..") {
            return None;
        }
        let dir = match ns {
            Namespace::Standard => self.root.clone(),
            Namespace::Antigravity => self.root.join("antigravity"),
        };
        Some(dir.join(filename))
    }

    fn persist_states(&self, state: &FileState) {
        let doc = serde_json::json!({
            Namespace::Standard.table(): state.standard.states,
            Namespace::Antigravity.table(): state.antigravity.states,
        });
        if let Err(e) = write_atomic(&self.root.join(STATE_FILE), &doc) {
            tracing::error!(error = %e, "failed to persist credential state");
        }
    }

    fn persist_config(&self, state: &FileState) {
        if let Err(e) = write_atomic(
            &self.root.join(CONFIG_FILE),
            &serde_json::json!(state.config),
        ) {
            tracing::error!(error = %e, "failed to persist config");
        }
    }
}

fn scan_credential_files(dir: &Path) -> HashMap<String, Value> {
    let mut out = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to scan credentials dir");
            return out;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if filename == STATE_FILE || filename == CONFIG_FILE {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| serde_json::from_str::<Value>(&c).map_err(Into::into))
        {
            Ok(data) => {
                out.insert(filename.to_string(), data);
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable credential file");
            }
        }
    }
    out
}

type StateMaps = (
    HashMap<String, StoredState>,
    HashMap<String, StoredState>,
);

fn load_state_file(path: &Path) -> anyhow::Result<StateMaps> {
    let contents = std::fs::read_to_string(path)?;
    let doc: Value = serde_json::from_str(&contents)?;
    let parse = |key: &str| -> HashMap<String, StoredState> {
        doc.get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    };
    Ok((
        parse(Namespace::Standard.table()),
        parse(Namespace::Antigravity.table()),
    ))
}

fn load_json_map(path: &Path) -> anyhow::Result<HashMap<String, Value>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_atomic(path: &Path, value: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

#[async_trait]
impl Storage for FileStorage {
    async fn store_credential(&self, ns: Namespace, filename: &str, data: &Value) -> bool {
        let Some(path) = self.credential_path(ns, filename) else {
            tracing::error!(filename, "invalid credential filename");
            return false;
        };

        let mut state = self.inner.write().await;
        if let Some(token) = refresh_token_of(data) {
            let duplicate = state.ns(ns).credentials.iter().find(|(existing, cred)| {
                existing.as_str() != filename && refresh_token_of(cred) == Some(token)
            });
            if let Some((existing, _)) = duplicate {
                tracing::debug!(filename, existing = %existing, "skipped duplicate refresh_token");
                return false;
            }
        }

        let contents = match serde_json::to_string_pretty(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(filename, error = %e, "failed to serialize credential");
                return false;
            }
        };
        if let Err(e) = std::fs::write(&path, contents) {
            tracing::error!(filename, error = %e, "failed to write credential file");
            return false;
        }

        let data_ns = state.ns_mut(ns);
        data_ns.credentials.insert(filename.to_string(), data.clone());
        if !data_ns.states.contains_key(filename) {
            let order = data_ns.next_rotation_order();
            data_ns.states.insert(
                filename.to_string(),
                StoredState {
                    state: CredentialState {
                        last_success: Some(epoch_now()),
                        ..Default::default()
                    },
                    rotation_order: order,
                    call_count: 0,
                },
            );
        }
        self.persist_states(&state);
        tracing::debug!(filename, "stored credential");
        true
    }

    async fn get_credential(&self, ns: Namespace, filename: &str) -> Option<Value> {
        self.inner.read().await.ns(ns).credentials.get(filename).cloned()
    }

    async fn list_credentials(&self, ns: Namespace) -> Vec<String> {
        let state = self.inner.read().await;
        let data = state.ns(ns);
        let mut names: Vec<String> = data.credentials.keys().cloned().collect();
        names.sort_by_key(|name| {
            data.states
                .get(name)
                .map(|s| s.rotation_order)
                .unwrap_or(i64::MAX)
        });
        names
    }

    async fn delete_credential(&self, ns: Namespace, filename: &str) -> bool {
        let mut state = self.inner.write().await;
        let removed = state.ns_mut(ns).credentials.remove(filename).is_some();
        state.ns_mut(ns).states.remove(filename);
        if removed {
            if let Some(path) = self.credential_path(ns, filename) {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(filename, error = %e, "failed to remove credential file");
                }
            }
            self.persist_states(&state);
            tracing::debug!(filename, "deleted credential");
        }
        removed
    }

    async fn get_enabled_credentials(&self, ns: Namespace) -> Vec<EnabledCredential> {
        let now = epoch_now();
        let state = self.inner.read().await;
        let data = state.ns(ns);
        data.credentials
            .iter()
            .filter_map(|(filename, cred)| {
                let stored = data.states.get(filename);
                if stored.map(|s| s.state.disabled).unwrap_or(false) {
                    return None;
                }
                let mut cooldowns = stored
                    .map(|s| s.state.model_cooldowns.clone())
                    .unwrap_or_default();
                cooldowns.retain(|_, until| *until > now);
                Some(EnabledCredential {
                    filename: filename.clone(),
                    credential_data: cred.clone(),
                    model_cooldowns: cooldowns,
                })
            })
            .collect()
    }

    async fn get_credential_state(&self, ns: Namespace, filename: &str) -> CredentialState {
        self.inner
            .read()
            .await
            .ns(ns)
            .states
            .get(filename)
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    async fn update_credential_state(
        &self,
        ns: Namespace,
        filename: &str,
        update: StateUpdate,
    ) -> bool {
        let mut state = self.inner.write().await;
        if !state.ns(ns).credentials.contains_key(filename) {
            return false;
        }
        let stored = state.ns_mut(ns).states.entry(filename.to_string()).or_default();
        apply_state_update(&mut stored.state, update);
        self.persist_states(&state);
        true
    }

    async fn get_all_credential_states(&self, ns: Namespace) -> HashMap<String, CredentialState> {
        let now = epoch_now();
        let state = self.inner.read().await;
        state
            .ns(ns)
            .states
            .iter()
            .map(|(filename, stored)| {
                let mut s = stored.state.clone();
                s.prune_cooldowns(now);
                (filename.clone(), s)
            })
            .collect()
    }

    async fn set_model_cooldown(
        &self,
        ns: Namespace,
        filename: &str,
        model_key: &str,
        cooldown_until: Option<f64>,
    ) -> bool {
        let mut state = self.inner.write().await;
        let Some(stored) = state.ns_mut(ns).states.get_mut(filename) else {
            tracing::warn!(filename, "credential not found for cooldown update");
            return false;
        };
        match cooldown_until {
            Some(until) => {
                stored.state.model_cooldowns.insert(model_key.to_string(), until);
            }
            None => {
                stored.state.model_cooldowns.remove(model_key);
            }
        }
        self.persist_states(&state);
        tracing::debug!(filename, model_key, "set model cooldown");
        true
    }

    async fn increment_call_count(&self, ns: Namespace, filename: &str) -> bool {
        let mut state = self.inner.write().await;
        let Some(stored) = state.ns_mut(ns).states.get_mut(filename) else {
            return false;
        };
        stored.call_count += 1;
        self.persist_states(&state);
        true
    }

    async fn get_credentials_summary(
        &self,
        ns: Namespace,
        query: &SummaryQuery,
    ) -> CredentialsSummary {
        let state = self.inner.read().await;
        let data = state.ns(ns);
        let rows = data
            .credentials
            .keys()
            .map(|filename| {
                let stored = data.states.get(filename).cloned().unwrap_or_default();
                CredentialSummary {
                    filename: filename.clone(),
                    disabled: stored.state.disabled,
                    error_codes: stored.state.error_codes,
                    last_success: stored.state.last_success,
                    user_email: stored.state.user_email,
                    rotation_order: stored.rotation_order,
                    call_count: stored.call_count,
                    model_cooldowns: stored.state.model_cooldowns,
                }
            })
            .collect();
        build_summary(rows, query)
    }

    async fn get_config(&self, key: &str) -> Option<Value> {
        self.inner.read().await.config.get(key).cloned()
    }

    async fn set_config(&self, key: &str, value: Value) -> bool {
        let mut state = self.inner.write().await;
        state.config.insert(key.to_string(), value);
        self.persist_config(&state);
        true
    }

    async fn delete_config(&self, key: &str) -> bool {
        let mut state = self.inner.write().await;
        state.config.remove(key);
        self.persist_config(&state);
        true
    }

    async fn get_all_config(&self) -> HashMap<String, Value> {
        self.inner.read().await.config.clone()
    }

    async fn reload_config_cache(&self) {
        let config_path = self.root.join(CONFIG_FILE);
        let loaded = if config_path.exists() {
            match load_json_map(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "failed to reload config");
                    return;
                }
            }
        } else {
            HashMap::new()
        };
        self.inner.write().await.config = loaded;
        tracing::info!("config cache reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::batch_store_credentials;
    use serde_json::json;

    fn bundle(token: &str) -> Value {
        json!({
            "refresh_token": token,
            "access_token": "ya29.test",
            "project_id": "proj-1"
        })
    }

    async fn open_temp() -> (tempfile::TempDir, FileStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn credential_round_trip() {
        let (_dir, storage) = open_temp().await;
        let ns = Namespace::Standard;

        assert!(storage.store_credential(ns, "a.json", &bundle("rt-a")).await);
        assert_eq!(
            storage.get_credential(ns, "a.json").await,
            Some(bundle("rt-a"))
        );
        assert_eq!(storage.list_credentials(ns).await, vec!["a.json"]);

        assert!(storage.delete_credential(ns, "a.json").await);
        assert!(storage.get_credential(ns, "a.json").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_refresh_token_is_rejected() {
        let (_dir, storage) = open_temp().await;
        let ns = Namespace::Standard;

        assert!(storage.store_credential(ns, "a.json", &bundle("same")).await);
        assert!(!storage.store_credential(ns, "b.json", &bundle("same")).await);
        assert_eq!(storage.list_credentials(ns).await.len(), 1);

        // Re-storing under the same filename is an update, not a duplicate.
        assert!(storage.store_credential(ns, "a.json", &bundle("same")).await);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let (_dir, storage) = open_temp().await;
        assert!(
            storage
                .store_credential(Namespace::Standard, "a.json", &bundle("rt-1"))
                .await
        );
        // Same token in the other namespace is not a duplicate.
        assert!(
            storage
                .store_credential(Namespace::Antigravity, "b.json", &bundle("rt-1"))
                .await
        );
        assert!(storage
            .get_credential(Namespace::Antigravity, "a.json")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn disabled_credentials_are_not_enabled() {
        let (_dir, storage) = open_temp().await;
        let ns = Namespace::Standard;
        storage.store_credential(ns, "a.json", &bundle("rt-a")).await;
        storage.store_credential(ns, "b.json", &bundle("rt-b")).await;

        storage
            .update_credential_state(
                ns,
                "a.json",
                StateUpdate {
                    disabled: Some(true),
                    ..Default::default()
                },
            )
            .await;

        let enabled = storage.get_enabled_credentials(ns).await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].filename, "b.json");
    }

    #[tokio::test]
    async fn cooldowns_expire_lazily() {
        let (_dir, storage) = open_temp().await;
        let ns = Namespace::Standard;
        storage.store_credential(ns, "a.json", &bundle("rt-a")).await;

        storage
            .set_model_cooldown(ns, "a.json", "gemini-2.5-pro", Some(epoch_now() - 1.0))
            .await;
        let enabled = storage.get_enabled_credentials(ns).await;
        assert!(enabled[0].model_cooldowns.is_empty());

        storage
            .set_model_cooldown(ns, "a.json", "gemini-2.5-pro", Some(epoch_now() + 60.0))
            .await;
        let enabled = storage.get_enabled_credentials(ns).await;
        assert!(enabled[0].model_cooldowns.contains_key("gemini-2.5-pro"));
    }

    #[tokio::test]
    async fn config_round_trip_survives_reload() {
        let (_dir, storage) = open_temp().await;
        assert!(storage.set_config("compatibility_mode", json!(true)).await);
        storage.reload_config_cache().await;
        assert_eq!(
            storage.get_config("compatibility_mode").await,
            Some(json!(true))
        );
        assert!(storage.delete_config("compatibility_mode").await);
        assert!(storage.get_config("compatibility_mode").await.is_none());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage
                .store_credential(Namespace::Standard, "a.json", &bundle("rt-a"))
                .await;
            storage
                .update_credential_state(
                    Namespace::Standard,
                    "a.json",
                    StateUpdate {
                        error_codes: Some(vec![429]),
                        ..Default::default()
                    },
                )
                .await;
            storage.increment_call_count(Namespace::Standard, "a.json").await;
        }

        let storage = FileStorage::open(dir.path()).await.unwrap();
        let state = storage
            .get_credential_state(Namespace::Standard, "a.json")
            .await;
        assert_eq!(state.error_codes, vec![429]);
        let summary = storage
            .get_credentials_summary(Namespace::Standard, &SummaryQuery::default())
            .await;
        assert_eq!(summary.items[0].call_count, 1);
    }

    #[tokio::test]
    async fn batch_store_skips_duplicates() {
        let (_dir, storage) = open_temp().await;
        let mut batch = HashMap::new();
        batch.insert("a.json".to_string(), bundle("rt-1"));
        batch.insert("b.json".to_string(), bundle("rt-2"));
        let stored = batch_store_credentials(&storage, Namespace::Standard, &batch).await;
        assert_eq!(stored, 2);

        let mut dup = HashMap::new();
        dup.insert("c.json".to_string(), bundle("rt-1"));
        let stored = batch_store_credentials(&storage, Namespace::Standard, &dup).await;
        assert_eq!(stored, 0);
    }
}
