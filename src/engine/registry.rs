//! Per-project sandbox cache: the single authority for "is there currently
//! a usable sandbox for this project."

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::EngineError;

use super::models::{KillOutcome, Provisioned};
use super::provider::{Sandbox, SandboxProvider};

struct CacheEntry {
    sandbox: Arc<dyn Sandbox>,
    sandbox_id: String,
}

/// Maps project identity to a live sandbox handle.
///
/// Constructed once at startup and passed by reference to the components
/// that need it, so tests can substitute an isolated instance. At most one
/// cached handle exists per project at any instant; operations against
/// different projects are fully independent.
pub struct SandboxRegistry {
    provider: Arc<dyn SandboxProvider>,
    idle_timeout: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    // Per-project provisioning locks: concurrent callers for the same
    // project serialize here instead of racing to create duplicate
    // sandboxes. The second caller finds the first one's cache entry.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SandboxRegistry {
    pub fn new(provider: Arc<dyn SandboxProvider>, idle_timeout: Duration) -> Self {
        Self {
            provider,
            idle_timeout,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn provisioning_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        inflight
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached(&self, project_id: &str) -> Option<Provisioned> {
        let cache = self.cache.lock().unwrap();
        cache.get(project_id).map(|entry| Provisioned {
            sandbox: entry.sandbox.clone(),
            sandbox_id: entry.sandbox_id.clone(),
            is_new: false,
        })
    }

    fn insert(&self, project_id: &str, sandbox: Arc<dyn Sandbox>) -> String {
        let sandbox_id = sandbox.id().to_string();
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            project_id.to_string(),
            CacheEntry {
                sandbox,
                sandbox_id: sandbox_id.clone(),
            },
        );
        sandbox_id
    }

    fn evict(&self, project_id: &str) -> Option<CacheEntry> {
        self.cache.lock().unwrap().remove(project_id)
    }

    /// Resolve a usable sandbox for the project.
    ///
    /// Order: cached handle confirmed running (TTL refreshed) → reconnect
    /// by `stored_sandbox_id` (any reconnect error is non-fatal) → fresh
    /// create. `is_new == true` obliges the caller to restore the persisted
    /// file set before treating the sandbox as usable.
    pub async fn get_or_create(
        &self,
        project_id: &str,
        stored_sandbox_id: Option<&str>,
    ) -> Result<Provisioned, EngineError> {
        let lock = self.provisioning_lock(project_id);
        let result = {
            let _guard = lock.lock().await;
            self.resolve(project_id, stored_sandbox_id).await
        };

        // Last caller out drops the map entry. Counted under the map lock,
        // so a concurrent provisioning_lock cannot clone in between: a
        // strong count of two means the map and this frame hold the only
        // references.
        let mut inflight = self.inflight.lock().unwrap();
        if Arc::strong_count(&lock) == 2 {
            inflight.remove(project_id);
        }
        result
    }

    async fn resolve(
        &self,
        project_id: &str,
        stored_sandbox_id: Option<&str>,
    ) -> Result<Provisioned, EngineError> {
        if let Some(cached) = self.cached(project_id) {
            match cached.sandbox.is_running().await {
                Ok(true) => {
                    if let Err(e) = cached.sandbox.set_timeout(self.idle_timeout).await {
                        warn!(project_id, error = %e, "Failed to refresh sandbox TTL");
                    }
                    return Ok(cached);
                }
                Ok(false) => {
                    debug!(project_id, sandbox_id = %cached.sandbox_id, "Cached sandbox no longer running, evicting");
                    self.evict(project_id);
                }
                Err(e) => {
                    debug!(project_id, error = %e, "Cached sandbox health check failed, evicting");
                    self.evict(project_id);
                }
            }
        }

        if let Some(stored_id) = stored_sandbox_id {
            match self.provider.connect(stored_id).await {
                Ok(sandbox) => {
                    if let Err(e) = sandbox.set_timeout(self.idle_timeout).await {
                        warn!(project_id, error = %e, "Failed to refresh sandbox TTL");
                    }
                    let sandbox_id = self.insert(project_id, sandbox.clone());
                    debug!(project_id, %sandbox_id, "Reconnected to existing sandbox");
                    return Ok(Provisioned {
                        sandbox,
                        sandbox_id,
                        is_new: false,
                    });
                }
                // Expired or unknown sandboxes are expected; fall through
                // to a fresh create.
                Err(e) => {
                    debug!(project_id, stored_id, error = %e, "Reconnect failed, creating fresh sandbox");
                }
            }
        }

        let sandbox = self
            .provider
            .create(self.idle_timeout)
            .await
            .map_err(|e| EngineError::provisioning(e.to_string()))?;
        let sandbox_id = self.insert(project_id, sandbox.clone());
        debug!(project_id, %sandbox_id, "Created fresh sandbox");
        Ok(Provisioned {
            sandbox,
            sandbox_id,
            is_new: true,
        })
    }

    /// The cached handle, if any, without provisioning. Used by operations
    /// that must not create sandboxes implicitly (command run, preview).
    pub fn peek(&self, project_id: &str) -> Option<Provisioned> {
        self.cached(project_id)
    }

    /// Evict and destroy the project's sandbox. Never raises: provider
    /// "already destroyed" responses are success, and destroy errors are
    /// reported only through the returned outcome so call sites can log.
    pub async fn kill(&self, project_id: &str, stored_sandbox_id: Option<&str>) -> KillOutcome {
        if let Some(entry) = self.evict(project_id) {
            return match entry.sandbox.kill().await {
                Ok(true) => KillOutcome::Killed,
                Ok(false) => KillOutcome::AlreadyGone,
                Err(e) => {
                    warn!(project_id, error = %e, "Sandbox kill failed, treating as gone");
                    KillOutcome::AlreadyGone
                }
            };
        }
        if let Some(stored_id) = stored_sandbox_id {
            return match self.provider.destroy(stored_id).await {
                Ok(true) => KillOutcome::Killed,
                Ok(false) => KillOutcome::AlreadyGone,
                Err(e) => {
                    warn!(project_id, stored_id, error = %e, "Sandbox destroy failed, treating as gone");
                    KillOutcome::AlreadyGone
                }
            };
        }
        KillOutcome::NothingToKill
    }

    /// Drop every cached handle without destroying the sandboxes.
    /// Shutdown/test hook.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
        self.inflight.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub(crate) fn inflight_locks(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::LocalProvider;

    fn registry() -> (Arc<LocalProvider>, SandboxRegistry) {
        let provider = Arc::new(LocalProvider::new());
        let registry = SandboxRegistry::new(provider.clone(), Duration::from_secs(3600));
        (provider, registry)
    }

    #[tokio::test]
    async fn test_second_call_reuses_cached_sandbox() {
        let (provider, registry) = registry();

        let first = registry.get_or_create("p1", None).await.unwrap();
        assert!(first.is_new);

        let second = registry.get_or_create("p1", None).await.unwrap();
        assert!(!second.is_new);
        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert_eq!(provider.create_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_attempts_one_reconnect_then_creates() {
        let (provider, registry) = registry();

        let first = registry.get_or_create("p1", None).await.unwrap();
        let stored_id = first.sandbox_id.clone();

        // Sandbox expires out from under the cache.
        provider.set_running(&stored_id, false);

        let second = registry
            .get_or_create("p1", Some(&stored_id))
            .await
            .unwrap();
        assert!(second.is_new, "reconnect to a stopped sandbox must fall through to create");
        assert_ne!(second.sandbox_id, stored_id);
        assert_eq!(provider.connect_count(), 1);
        assert_eq!(provider.create_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_by_stored_id_on_cache_miss() {
        let (provider, registry) = registry();

        let first = registry.get_or_create("p1", None).await.unwrap();
        let stored_id = first.sandbox_id.clone();

        // Simulate a server restart: cache gone, sandbox still running.
        registry.clear();

        let second = registry
            .get_or_create("p1", Some(&stored_id))
            .await
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.sandbox_id, stored_id);
        assert_eq!(provider.create_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_create() {
        let provider = Arc::new(LocalProvider::new());
        let registry = Arc::new(SandboxRegistry::new(
            provider.clone(),
            Duration::from_secs(3600),
        ));

        let a = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("p1", None).await })
        };
        let b = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("p1", None).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.sandbox_id, b.sandbox_id);
        assert_eq!(provider.create_count(), 1);
        assert!(a.is_new ^ b.is_new, "exactly one caller should see a fresh sandbox");
        assert_eq!(registry.inflight_locks(), 0);
    }

    #[tokio::test]
    async fn test_inflight_lock_entries_released_after_provisioning() {
        let (_provider, registry) = registry();

        registry.get_or_create("p1", None).await.unwrap();
        registry.get_or_create("p1", None).await.unwrap();
        registry.get_or_create("p2", None).await.unwrap();
        assert_eq!(registry.inflight_locks(), 0);
    }

    #[tokio::test]
    async fn test_projects_get_independent_sandboxes() {
        let (provider, registry) = registry();

        let a = registry.get_or_create("p1", None).await.unwrap();
        let b = registry.get_or_create("p2", None).await.unwrap();
        assert_ne!(a.sandbox_id, b.sandbox_id);
        assert_eq!(provider.create_count(), 2);
    }

    #[tokio::test]
    async fn test_kill_with_nothing_cached_or_stored() {
        let (provider, registry) = registry();
        let outcome = registry.kill("p1", None).await;
        assert_eq!(outcome, KillOutcome::NothingToKill);
        assert_eq!(provider.create_count(), 0);
        assert_eq!(provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_cached_then_by_stored_id() {
        let (provider, registry) = registry();

        let first = registry.get_or_create("p1", None).await.unwrap();
        let stored_id = first.sandbox_id.clone();

        assert_eq!(registry.kill("p1", None).await, KillOutcome::Killed);
        assert!(registry.peek("p1").is_none());

        // Destroy by stored id after the cache is empty.
        assert_eq!(
            registry.kill("p1", Some(&stored_id)).await,
            KillOutcome::Killed
        );
        // And again: already gone is success.
        assert_eq!(
            registry.kill("p1", Some(&stored_id)).await,
            KillOutcome::AlreadyGone
        );
        assert_eq!(provider.create_count(), 1);
    }

    #[tokio::test]
    async fn test_peek_never_provisions() {
        let (provider, registry) = registry();
        assert!(registry.peek("p1").is_none());
        assert_eq!(provider.create_count(), 0);
    }
}
