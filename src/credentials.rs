//! Credential pool: selection, rotation, and error bookkeeping.
//!
//! The pool owns no durable state of its own — every decision reads from
//! the storage adapter, so multiple gateway processes can share one store.
//! Selection is a uniform shuffle over enabled records (no round-robin);
//! `rotation_order` only stabilizes display sorting.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::models::StateUpdate;
use crate::storage::{epoch_now, Namespace, Storage};

/// Error codes kept per credential.
pub const MAX_ERROR_HISTORY: usize = 10;

/// A credential is disabled when this many consecutive trailing errors are
/// all fatal auth codes.
pub const AUTO_DISABLE_WINDOW: usize = 3;

/// Status codes that indicate revoked or broken credentials.
const FATAL_AUTH_CODES: [i64; 2] = [401, 403];

/// Pool over one credential namespace.
pub struct CredentialPool {
    storage: Arc<dyn Storage>,
    namespace: Namespace,
    /// Filename handed out by the most recent selection.
    current: RwLock<Option<String>>,
}

impl CredentialPool {
    pub fn new(storage: Arc<dyn Storage>, namespace: Namespace) -> Self {
        Self {
            storage,
            namespace,
            current: RwLock::new(None),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Pick a usable credential: shuffle the enabled records, skip any in
    /// cooldown for `model_key`, return the first survivor.
    pub async fn get_valid_credential(
        &self,
        model_key: Option<&str>,
    ) -> Option<(String, Value)> {
        let mut records = self.storage.get_enabled_credentials(self.namespace).await;
        {
            let mut rng = rand::thread_rng();
            records.shuffle(&mut rng);
        }

        let now = epoch_now();
        for record in records {
            if let Some(model) = model_key {
                if record
                    .model_cooldowns
                    .get(model)
                    .is_some_and(|until| *until > now)
                {
                    tracing::debug!(
                        credential = %record.filename,
                        model,
                        "skipping credential in cooldown"
                    );
                    continue;
                }
            }
            *self.current.write().await = Some(record.filename.clone());
            tracing::debug!(credential = %record.filename, "selected credential");
            return Some((record.filename, record.credential_data));
        }

        tracing::warn!("no usable credential in pool");
        None
    }

    /// Best-effort bump of the in-use credential's call counter.
    pub async fn increment_call_count(&self) {
        let current = self.current.read().await.clone();
        if let Some(filename) = current {
            self.storage
                .increment_call_count(self.namespace, &filename)
                .await;
        }
    }

    /// Record a failed backend call.
    ///
    /// Appends the status to the bounded error history; a 429 additionally
    /// puts the credential into a per-model cooldown, and a trailing run of
    /// fatal auth codes disables it.
    pub async fn record_error(
        &self,
        filename: &str,
        status: u16,
        model_key: Option<&str>,
        cooldown_seconds: f64,
    ) {
        let state = self
            .storage
            .get_credential_state(self.namespace, filename)
            .await;

        let mut error_codes = state.error_codes;
        error_codes.push(status as i64);
        if error_codes.len() > MAX_ERROR_HISTORY {
            let excess = error_codes.len() - MAX_ERROR_HISTORY;
            error_codes.drain(..excess);
        }

        let disable = error_codes.len() >= AUTO_DISABLE_WINDOW
            && error_codes[error_codes.len() - AUTO_DISABLE_WINDOW..]
                .iter()
                .all(|code| FATAL_AUTH_CODES.contains(code));

        if disable {
            tracing::warn!(
                credential = %filename,
                "disabling credential after repeated auth failures"
            );
        } else {
            tracing::info!(credential = %filename, status, "recorded credential error");
        }

        self.storage
            .update_credential_state(
                self.namespace,
                filename,
                StateUpdate {
                    error_codes: Some(error_codes),
                    disabled: disable.then_some(true),
                    ..Default::default()
                },
            )
            .await;

        if status == 429 {
            if let Some(model) = model_key {
                let until = epoch_now() + cooldown_seconds;
                self.storage
                    .set_model_cooldown(self.namespace, filename, model, Some(until))
                    .await;
                tracing::info!(
                    credential = %filename,
                    model,
                    cooldown_secs = cooldown_seconds,
                    "credential placed in model cooldown"
                );
            }
        }
    }

    /// Record a successful backend call: stamp `last_success` and clear the
    /// error history.
    pub async fn record_success(&self, filename: &str) {
        self.storage
            .update_credential_state(
                self.namespace,
                filename,
                StateUpdate {
                    last_success: Some(epoch_now()),
                    error_codes: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await;
    }

    /// Persist a refreshed token bundle.
    pub async fn store_token_bundle(&self, filename: &str, bundle: &Value) {
        if !self
            .storage
            .store_credential(self.namespace, filename, bundle)
            .await
        {
            tracing::warn!(credential = %filename, "failed to persist refreshed token bundle");
        }
    }

    /// Active (unexpired) cooldowns per credential, for display.
    pub async fn active_cooldowns(&self) -> HashMap<String, HashMap<String, f64>> {
        self.storage
            .get_all_credential_states(self.namespace)
            .await
            .into_iter()
            .map(|(filename, state)| (filename, state.model_cooldowns))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use serde_json::json;

    fn bundle(token: &str) -> Value {
        json!({ "refresh_token": token, "access_token": "ya29.x", "project_id": "p" })
    }

    async fn pool_with(creds: &[(&str, &str)]) -> (tempfile::TempDir, CredentialPool) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        for (filename, token) in creds {
            assert!(
                storage
                    .store_credential(Namespace::Standard, filename, &bundle(token))
                    .await
            );
        }
        (dir, CredentialPool::new(storage, Namespace::Standard))
    }

    #[tokio::test]
    async fn selection_returns_some_enabled_credential() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a"), ("b.json", "rt-b")]).await;
        let (filename, data) = pool.get_valid_credential(None).await.unwrap();
        assert!(filename == "a.json" || filename == "b.json");
        assert!(data.get("refresh_token").is_some());
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let (_dir, pool) = pool_with(&[]).await;
        assert!(pool.get_valid_credential(None).await.is_none());
    }

    #[tokio::test]
    async fn cooled_down_credential_is_skipped_for_that_model_only() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        pool.record_error("a.json", 429, Some("gemini-2.5-pro"), 60.0)
            .await;

        assert!(pool.get_valid_credential(Some("gemini-2.5-pro")).await.is_none());
        // Other models are unaffected.
        assert!(pool
            .get_valid_credential(Some("gemini-2.5-flash"))
            .await
            .is_some());
        // As is selection without a model key.
        assert!(pool.get_valid_credential(None).await.is_some());
    }

    #[tokio::test]
    async fn expired_cooldown_makes_credential_eligible_again() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        pool.record_error("a.json", 429, Some("gemini-2.5-pro"), -1.0)
            .await;
        assert!(pool.get_valid_credential(Some("gemini-2.5-pro")).await.is_some());
    }

    #[tokio::test]
    async fn repeated_auth_failures_disable_the_credential() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        for _ in 0..AUTO_DISABLE_WINDOW {
            pool.record_error("a.json", 401, None, 60.0).await;
        }
        assert!(pool.get_valid_credential(None).await.is_none());
    }

    #[tokio::test]
    async fn mixed_errors_do_not_disable() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        pool.record_error("a.json", 401, None, 60.0).await;
        pool.record_error("a.json", 500, None, 60.0).await;
        pool.record_error("a.json", 403, None, 60.0).await;
        assert!(pool.get_valid_credential(None).await.is_some());
    }

    #[tokio::test]
    async fn error_history_is_bounded() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        for _ in 0..(MAX_ERROR_HISTORY + 5) {
            pool.record_error("a.json", 500, None, 60.0).await;
        }
        let state = pool
            .storage
            .get_credential_state(Namespace::Standard, "a.json")
            .await;
        assert_eq!(state.error_codes.len(), MAX_ERROR_HISTORY);
    }

    #[tokio::test]
    async fn success_clears_error_history() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        pool.record_error("a.json", 500, None, 60.0).await;
        pool.record_success("a.json").await;
        let state = pool
            .storage
            .get_credential_state(Namespace::Standard, "a.json")
            .await;
        assert!(state.error_codes.is_empty());
        assert!(state.last_success.is_some());
    }

    #[tokio::test]
    async fn disabled_credential_never_selected_over_many_draws() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a"), ("b.json", "rt-b")]).await;
        for _ in 0..AUTO_DISABLE_WINDOW {
            pool.record_error("a.json", 403, None, 60.0).await;
        }
        for _ in 0..50 {
            let (filename, _) = pool.get_valid_credential(None).await.unwrap();
            assert_eq!(filename, "b.json");
        }
    }

    #[tokio::test]
    async fn active_cooldowns_reflect_recent_rate_limits() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a"), ("b.json", "rt-b")]).await;
        pool.record_error("a.json", 429, Some("gemini-2.5-pro"), 60.0)
            .await;
        let cooldowns = pool.active_cooldowns().await;
        assert!(cooldowns["a.json"].contains_key("gemini-2.5-pro"));
        assert!(cooldowns["b.json"].is_empty());
    }

    #[tokio::test]
    async fn call_count_tracks_current_selection() {
        let (_dir, pool) = pool_with(&[("a.json", "rt-a")]).await;
        pool.get_valid_credential(None).await.unwrap();
        pool.increment_call_count().await;
        pool.increment_call_count().await;
        let summary = pool
            .storage
            .get_credentials_summary(Namespace::Standard, &Default::default())
            .await;
        assert_eq!(summary.items[0].call_count, 2);
    }
}
