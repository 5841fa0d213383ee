//! Ephemeral context store.
//!
//! Contexts carry per-session state shared between callers, agents and
//! workflow steps. Every context expires; an expired context behaves exactly
//! like a missing one and is removed the first time it is touched.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};

/// Kind of context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextType {
    /// A signed-in user's session.
    UserSession,
    /// A learning session (lesson, quiz, course run).
    LearningSession,
    /// One AI interaction.
    AiInteraction,
    /// Internal system operation.
    SystemOperation,
}

/// A stored context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// Context ID.
    pub id: String,
    /// Context kind.
    #[serde(rename = "type")]
    pub context_type: ContextType,
    /// Owning user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Owning session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Context data.
    pub data: Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

impl Context {
    /// Whether the context has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Parameters for creating a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContext {
    /// Context kind.
    #[serde(rename = "type")]
    pub context_type: ContextType,
    /// Initial data.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Owning user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Owning session.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Time to live; the store default applies when absent.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl NewContext {
    /// Context of `context_type` with no data.
    #[must_use]
    pub fn new(context_type: ContextType) -> Self {
        Self { context_type, data: Map::new(), user_id: None, session_id: None, ttl_ms: None }
    }

    /// Sets the initial data.
    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Sets the owning user.
    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the owning session.
    #[must_use]
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }
}

/// Context counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    /// Live contexts.
    pub total: usize,
    /// Live contexts per type.
    pub by_type: HashMap<ContextType, usize>,
}

/// In-memory context store.
pub struct ContextStore {
    contexts: Arc<RwLock<HashMap<String, Context>>>,
    default_ttl: Duration,
}

impl fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextStore")
            .field("context_count", &self.contexts.try_read().map(|c| c.len()).unwrap_or(0))
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl ContextStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self { contexts: Arc::new(RwLock::new(HashMap::new())), default_ttl }
    }

    /// Creates a context.
    pub async fn create(&self, params: NewContext) -> Context {
        let now = Utc::now();
        let ttl = params.ttl_ms.map_or(self.default_ttl, Duration::from_millis);
        let context = Context {
            id: Uuid::new_v4().to_string(),
            context_type: params.context_type,
            user_id: params.user_id,
            session_id: params.session_id,
            data: params.data,
            created_at: now,
            updated_at: now,
            expires_at: expiry_after(now, ttl),
        };

        debug!(
            context_id = %context.id,
            context_type = ?context.context_type,
            ttl_ms = ttl.as_millis() as u64,
            "Created context"
        );
        self.contexts.write().await.insert(context.id.clone(), context.clone());
        context
    }

    /// Reads a live context.
    ///
    /// # Errors
    /// Returns `ContextNotFound` if the context is missing or expired.
    pub async fn get(&self, id: &str) -> Result<Context> {
        let now = Utc::now();
        {
            let contexts = self.contexts.read().await;
            match contexts.get(id) {
                None => return Err(OrchestrationError::ContextNotFound(id.to_string())),
                Some(context) if !context.is_expired_at(now) => return Ok(context.clone()),
                Some(_) => {}
            }
        }

        // Expired: take the write lock and purge it, unless it was extended meanwhile.
        let mut contexts = self.contexts.write().await;
        live_entry(&mut contexts, id, Utc::now()).cloned()
    }

    /// Shallow-merges `patch` into the context data.
    ///
    /// # Errors
    /// Returns `ContextNotFound` if the context is missing or expired.
    pub async fn update(&self, id: &str, patch: Map<String, Value>) -> Result<Context> {
        self.update_with(id, |data| data.extend(patch)).await
    }

    /// Applies `mutate` to the context data under the store's write lock.
    ///
    /// # Errors
    /// Returns `ContextNotFound` if the context is missing or expired.
    pub async fn update_with<F>(&self, id: &str, mutate: F) -> Result<Context>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let now = Utc::now();
        let mut contexts = self.contexts.write().await;
        let context = live_entry(&mut contexts, id, now)?;
        mutate(&mut context.data);
        context.updated_at = now;
        debug!(context_id = %id, "Updated context");
        Ok(context.clone())
    }

    /// Pushes the expiry to `now + ttl`.
    ///
    /// # Errors
    /// Returns `ContextNotFound` if the context is missing or already expired.
    pub async fn extend(&self, id: &str, ttl: Duration) -> Result<Context> {
        let now = Utc::now();
        let mut contexts = self.contexts.write().await;
        let context = live_entry(&mut contexts, id, now)?;
        context.expires_at = expiry_after(now, ttl);
        context.updated_at = now;
        debug!(context_id = %id, ttl_ms = ttl.as_millis() as u64, "Extended context");
        Ok(context.clone())
    }

    /// Deletes a context.
    ///
    /// # Returns
    /// Returns `true` if a live context was removed.
    pub async fn delete(&self, id: &str) -> bool {
        let mut contexts = self.contexts.write().await;
        contexts.remove(id).is_some_and(|c| !c.is_expired_at(Utc::now()))
    }

    /// Live contexts owned by `user_id`, oldest first.
    pub async fn list_by_user(&self, user_id: &str, context_type: Option<ContextType>) -> Vec<Context> {
        self.list_matching(|c| {
            c.user_id.as_deref() == Some(user_id) && context_type.is_none_or(|t| c.context_type == t)
        })
        .await
    }

    /// Live contexts in `session_id`, oldest first.
    pub async fn list_by_session(
        &self,
        session_id: &str,
        context_type: Option<ContextType>,
    ) -> Vec<Context> {
        self.list_matching(|c| {
            c.session_id.as_deref() == Some(session_id)
                && context_type.is_none_or(|t| c.context_type == t)
        })
        .await
    }

    async fn list_matching<F>(&self, predicate: F) -> Vec<Context>
    where
        F: Fn(&Context) -> bool,
    {
        let now = Utc::now();
        let mut contexts = self.contexts.write().await;
        contexts.retain(|_, c| !c.is_expired_at(now));
        let mut matching: Vec<Context> = contexts.values().filter(|c| predicate(c)).cloned().collect();
        matching.sort_by_key(|c| c.created_at);
        matching
    }

    /// Removes every expired context.
    ///
    /// # Returns
    /// The number of contexts removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|_, c| !c.is_expired_at(now));
        let removed = before - contexts.len();
        if removed > 0 {
            info!(removed, remaining = contexts.len(), "Swept expired contexts");
        }
        removed
    }

    /// Counts of live contexts.
    pub async fn stats(&self) -> ContextStats {
        let now = Utc::now();
        let contexts = self.contexts.read().await;
        let mut stats = ContextStats::default();
        for context in contexts.values().filter(|c| !c.is_expired_at(now)) {
            stats.total += 1;
            *stats.by_type.entry(context.context_type).or_default() += 1;
        }
        stats
    }

    /// Number of stored entries, expired ones included until swept.
    pub async fn stored_count(&self) -> usize {
        self.contexts.read().await.len()
    }
}

/// Returns the live entry for `id`, purging it if expired.
fn live_entry<'a>(
    contexts: &'a mut HashMap<String, Context>,
    id: &str,
    now: DateTime<Utc>,
) -> Result<&'a mut Context> {
    if contexts.get(id).is_some_and(|c| c.is_expired_at(now)) {
        contexts.remove(id);
        debug!(context_id = %id, "Purged expired context");
    }
    contexts.get_mut(id).ok_or_else(|| OrchestrationError::ContextNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ContextStore {
        ContextStore::new(Duration::from_secs(3600))
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let created = store
            .create(
                NewContext::new(ContextType::LearningSession)
                    .for_user("u-1")
                    .with_data(data(json!({"lesson": 3}))),
            )
            .await;

        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.data["lesson"], 3);
        assert!(fetched.expires_at > fetched.created_at);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_immediately_not_found() {
        let store = store();
        let created = store
            .create(NewContext::new(ContextType::AiInteraction).with_ttl(Duration::ZERO))
            .await;

        let err = store.get(&created.id).await.unwrap_err();
        assert_eq!(err.code(), "CONTEXT_NOT_FOUND");
        assert_eq!(store.stored_count().await, 0);
    }

    #[tokio::test]
    async fn test_elapsed_ttl_removes_context() {
        let store = store();
        let created = store
            .create(NewContext::new(ContextType::UserSession).with_ttl(Duration::from_millis(20)))
            .await;
        assert!(store.get(&created.id).await.is_ok());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get(&created.id).await.is_err());
        assert_eq!(store.stored_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_merges_top_level_keys() {
        let store = store();
        let created = store
            .create(
                NewContext::new(ContextType::UserSession)
                    .with_data(data(json!({"a": 1, "nested": {"x": 1}}))),
            )
            .await;

        let updated = store
            .update(&created.id, data(json!({"b": 2, "nested": {"y": 2}})))
            .await
            .unwrap();
        assert_eq!(updated.data["a"], 1);
        assert_eq!(updated.data["b"], 2);
        assert_eq!(updated.data["nested"], json!({"y": 2}));
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_keys() {
        let store = Arc::new(store());
        let created = store.create(NewContext::new(ContextType::SystemOperation)).await;

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let store = Arc::clone(&store);
                let id = created.id.clone();
                tokio::spawn(async move {
                    let mut patch = Map::new();
                    patch.insert(format!("k{i}"), json!(i));
                    store.update(&id, patch).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get(&created.id).await.unwrap().data.len(), 50);
    }

    #[tokio::test]
    async fn test_extend_and_delete() {
        let store = store();
        let created = store
            .create(NewContext::new(ContextType::UserSession).with_ttl(Duration::from_millis(30)))
            .await;
        let extended = store.extend(&created.id, Duration::from_secs(60)).await.unwrap();
        assert!(extended.expires_at > created.expires_at);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&created.id).await.is_ok());

        assert!(store.delete(&created.id).await);
        assert!(!store.delete(&created.id).await);
        assert!(store.update(&created.id, Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_listing_by_user_and_session() {
        let store = store();
        store.create(NewContext::new(ContextType::UserSession).for_user("u-1").in_session("s-1")).await;
        store.create(NewContext::new(ContextType::LearningSession).for_user("u-1")).await;
        store.create(NewContext::new(ContextType::UserSession).for_user("u-2").in_session("s-1")).await;
        store
            .create(NewContext::new(ContextType::UserSession).for_user("u-1").with_ttl(Duration::ZERO))
            .await;

        assert_eq!(store.list_by_user("u-1", None).await.len(), 2);
        assert_eq!(store.list_by_user("u-1", Some(ContextType::LearningSession)).await.len(), 1);
        assert_eq!(store.list_by_session("s-1", None).await.len(), 2);
        assert_eq!(store.stored_count().await, 3);
    }

    #[tokio::test]
    async fn test_sweep_and_stats() {
        let store = store();
        store.create(NewContext::new(ContextType::UserSession)).await;
        store.create(NewContext::new(ContextType::AiInteraction)).await;
        store.create(NewContext::new(ContextType::AiInteraction).with_ttl(Duration::ZERO)).await;

        assert_eq!(store.sweep().await, 1);
        let stats = store.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type.get(&ContextType::AiInteraction), Some(&1));
    }

    #[test]
    fn test_wire_format() {
        let params: NewContext = serde_json::from_str(
            r#"{"type": "LEARNING_SESSION", "userId": "u-1", "data": {"k": 1}, "ttlMs": 500}"#,
        )
        .unwrap();
        assert_eq!(params.context_type, ContextType::LearningSession);
        assert_eq!(params.ttl_ms, Some(500));
    }
}
