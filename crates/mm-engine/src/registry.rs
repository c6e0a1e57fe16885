//! Process-wide instance registry.
//!
//! Maps an opaque profile id to at most one running engine instance.
//! Starting resolves the profile through the [`ProfileStore`] and
//! rejects unknown or inactive profiles before any task is spawned;
//! stopping removes the entry first so the instance reads as
//! non-running while its loop winds down streams and cancels orders.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::credentials::{Profile, ProfileError, ProfileStore};

/// How long a stop waits for the instance loop to drain before
/// aborting it.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("profile is inactive: {0}")]
    ProfileInactive(String),

    #[error("instance already running for profile {0}")]
    AlreadyRunning(String),

    #[error("no running instance for profile {0}")]
    NotRunning(String),

    #[error(transparent)]
    Store(#[from] ProfileError),
}

/// Which engine variant an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    MarketMaker,
    Sniper,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::MarketMaker => "market-maker",
            InstanceKind::Sniper => "sniper",
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one running instance.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub profile_id: String,
    pub kind: InstanceKind,
    pub started_at: DateTime<Utc>,
}

struct InstanceHandle {
    kind: InstanceKind,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Registry of running instances, one per profile id.
pub struct InstanceRegistry {
    store: Arc<dyn ProfileStore>,
    instances: DashMap<String, InstanceHandle>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            instances: DashMap::new(),
        }
    }

    /// Resolve the profile and spawn an instance for it. The `launch`
    /// closure receives the resolved profile and a shutdown receiver
    /// and returns the instance's long-running future.
    pub async fn start<F, Fut>(
        &self,
        profile_id: &str,
        kind: InstanceKind,
        launch: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(Profile, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.instances.contains_key(profile_id) {
            return Err(RegistryError::AlreadyRunning(profile_id.to_string()));
        }

        let profile = self
            .store
            .lookup(profile_id)
            .await?
            .ok_or_else(|| RegistryError::ProfileNotFound(profile_id.to_string()))?;
        if !profile.active {
            return Err(RegistryError::ProfileInactive(profile_id.to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(launch(profile, shutdown_rx));
        info!(profile = profile_id, kind = %kind, "instance started");
        self.instances.insert(
            profile_id.to_string(),
            InstanceHandle {
                kind,
                shutdown: shutdown_tx,
                task,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Stop and remove an instance. The entry is removed before the
    /// signal is sent, so status queries never observe a half-stopped
    /// instance as running.
    pub async fn stop(&self, profile_id: &str) -> Result<(), RegistryError> {
        let (_, handle) = self
            .instances
            .remove(profile_id)
            .ok_or_else(|| RegistryError::NotRunning(profile_id.to_string()))?;

        info!(profile = profile_id, kind = %handle.kind, "instance stopping");
        // The loop handles the signal by closing streams and cancelling
        // resting orders; give it a bounded window to do so.
        let _ = handle.shutdown.send(true);
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(STOP_GRACE, handle.task).await.is_err() {
            warn!(profile = profile_id, "instance did not drain in time, aborting");
            abort.abort();
        }
        Ok(())
    }

    pub fn is_running(&self, profile_id: &str) -> bool {
        self.instances.contains_key(profile_id)
    }

    pub fn status(&self, profile_id: &str) -> Option<InstanceStatus> {
        self.instances.get(profile_id).map(|h| InstanceStatus {
            profile_id: profile_id.to_string(),
            kind: h.kind,
            started_at: h.started_at,
        })
    }

    pub fn list(&self) -> Vec<InstanceStatus> {
        self.instances
            .iter()
            .map(|entry| InstanceStatus {
                profile_id: entry.key().clone(),
                kind: entry.value().kind,
                started_at: entry.value().started_at,
            })
            .collect()
    }

    /// Stop everything, used at process shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(profile = %id, "stop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticProfileStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn profile(id: &str, active: bool) -> Profile {
        Profile {
            id: id.to_string(),
            private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .to_string(),
            funder_address: "0x0000000000000000000000000000000000000001".to_string(),
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            api_passphrase: "p".to_string(),
            active,
        }
    }

    fn registry_with(profiles: Vec<Profile>) -> InstanceRegistry {
        let store = StaticProfileStore::new();
        for p in profiles {
            store.insert(p);
        }
        InstanceRegistry::new(Arc::new(store))
    }

    async fn idle_instance(_profile: Profile, mut shutdown: watch::Receiver<bool>) {
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_profile_rejected() {
        let registry = registry_with(Vec::new());
        let result = registry
            .start("ghost", InstanceKind::MarketMaker, idle_instance)
            .await;
        assert!(matches!(result, Err(RegistryError::ProfileNotFound(_))));
        assert!(!registry.is_running("ghost"));
    }

    #[tokio::test]
    async fn test_inactive_profile_rejected() {
        let registry = registry_with(vec![profile("p1", false)]);
        let result = registry
            .start("p1", InstanceKind::MarketMaker, idle_instance)
            .await;
        assert!(matches!(result, Err(RegistryError::ProfileInactive(_))));
    }

    #[tokio::test]
    async fn test_start_stop_roundtrip() {
        let registry = registry_with(vec![profile("p1", true)]);
        let saw_shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_shutdown);

        registry
            .start("p1", InstanceKind::Sniper, move |_profile, mut shutdown| {
                async move {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            flag.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            })
            .await
            .unwrap();
        assert!(registry.is_running("p1"));
        assert_eq!(registry.status("p1").unwrap().kind, InstanceKind::Sniper);

        registry.stop("p1").await.unwrap();
        assert!(!registry.is_running("p1"));
        assert!(saw_shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let registry = registry_with(vec![profile("p1", true)]);
        registry
            .start("p1", InstanceKind::MarketMaker, idle_instance)
            .await
            .unwrap();
        let second = registry
            .start("p1", InstanceKind::MarketMaker, idle_instance)
            .await;
        assert!(matches!(second, Err(RegistryError::AlreadyRunning(_))));

        registry.stop("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_errors() {
        let registry = registry_with(Vec::new());
        let result = registry.stop("p1").await;
        assert!(matches!(result, Err(RegistryError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_stop_all_drains_every_instance() {
        let registry = registry_with(vec![profile("p1", true), profile("p2", true)]);
        registry
            .start("p1", InstanceKind::MarketMaker, idle_instance)
            .await
            .unwrap();
        registry
            .start("p2", InstanceKind::Sniper, idle_instance)
            .await
            .unwrap();
        assert_eq!(registry.list().len(), 2);

        registry.stop_all().await;
        assert!(registry.list().is_empty());
    }
}
