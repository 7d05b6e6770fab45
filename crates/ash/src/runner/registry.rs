//! Runner registry and selection.
//!
//! Runners register and heartbeat through the internal API; rows live in
//! the state store. A runner is dead once its last heartbeat falls outside
//! the liveness window, at which point it is excluded from selection and
//! its sessions become unroutable-warm (they cold-resume elsewhere via
//! snapshots).

use std::time::Duration;

use crate::store::models::{Runner, now_rfc3339};
use crate::store::{SharedStore, StoreResult};

/// Heartbeats older than this mark a runner dead.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Pluggable runner selection policy.
pub trait RunnerSelector: Send + Sync {
    /// Pick one runner from the live set, or `None` when all are full.
    fn select<'a>(&self, runners: &'a [Runner]) -> Option<&'a Runner>;
}

/// Default policy: most free slots, ties broken by registration age.
#[derive(Debug, Default)]
pub struct MostFreeSlots;

impl RunnerSelector for MostFreeSlots {
    fn select<'a>(&self, runners: &'a [Runner]) -> Option<&'a Runner> {
        runners
            .iter()
            .filter(|r| r.free_slots() > 0)
            .max_by(|a, b| {
                a.free_slots()
                    .cmp(&b.free_slots())
                    // Earlier registration wins a tie, so invert for max_by.
                    .then_with(|| b.registered_at.cmp(&a.registered_at))
            })
    }
}

/// Outcome of runner selection for a new sandbox.
#[derive(Debug)]
pub enum SelectOutcome {
    /// No live runners at all.
    NoRunners,
    /// Live runners exist but every slot is taken.
    AllFull,
    Chosen(Runner),
}

/// Registry over the stored runner rows.
pub struct RunnerRegistry {
    store: SharedStore,
    selector: Box<dyn RunnerSelector>,
    liveness: chrono::Duration,
}

impl RunnerRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self::with_selector(store, Box::new(MostFreeSlots))
    }

    pub fn with_selector(store: SharedStore, selector: Box<dyn RunnerSelector>) -> Self {
        Self {
            store,
            selector,
            liveness: chrono::Duration::from_std(LIVENESS_WINDOW)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    /// Upsert a runner row on registration.
    pub async fn register(
        &self,
        id: &str,
        host: &str,
        port: i64,
        max_sandboxes: i64,
    ) -> StoreResult<Runner> {
        let runner = Runner {
            id: id.to_string(),
            host: host.to_string(),
            port,
            max_sandboxes,
            active_count: 0,
            warming_count: 0,
            last_heartbeat_at: now_rfc3339(),
            registered_at: now_rfc3339(),
        };
        self.store.upsert_runner(&runner).await?;
        Ok(runner)
    }

    /// Record a heartbeat with current load counts.
    pub async fn heartbeat(
        &self,
        id: &str,
        active_count: i64,
        warming_count: i64,
    ) -> StoreResult<()> {
        self.store
            .heartbeat_runner(id, active_count, warming_count)
            .await
    }

    /// All registered runners, live or dead.
    pub async fn list(&self) -> StoreResult<Vec<Runner>> {
        self.store.list_runners().await
    }

    /// Runners inside the liveness window.
    pub async fn live_runners(&self) -> StoreResult<Vec<Runner>> {
        Ok(self
            .store
            .list_runners()
            .await?
            .into_iter()
            .filter(|r| r.is_live(self.liveness))
            .collect())
    }

    /// A specific runner, only if still live.
    pub async fn get_live(&self, id: &str) -> StoreResult<Option<Runner>> {
        Ok(self
            .store
            .get_runner(id)
            .await?
            .filter(|r| r.is_live(self.liveness)))
    }

    /// Pick a home for a new sandbox.
    pub async fn select(&self) -> StoreResult<SelectOutcome> {
        let live = self.live_runners().await?;
        if live.is_empty() {
            return Ok(SelectOutcome::NoRunners);
        }
        Ok(match self.selector.select(&live) {
            Some(runner) => SelectOutcome::Chosen(runner.clone()),
            None => SelectOutcome::AllFull,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StateStore};
    use std::sync::Arc;

    fn runner(id: &str, free: i64, registered_at: &str) -> Runner {
        Runner {
            id: id.to_string(),
            host: "h".to_string(),
            port: 1,
            max_sandboxes: 10,
            active_count: 10 - free,
            warming_count: 0,
            last_heartbeat_at: now_rfc3339(),
            registered_at: registered_at.to_string(),
        }
    }

    #[test]
    fn test_most_free_slots() {
        let selector = MostFreeSlots;
        let runners = vec![
            runner("a", 2, "2026-01-01T00:00:00Z"),
            runner("b", 5, "2026-01-02T00:00:00Z"),
            runner("c", 5, "2026-01-01T12:00:00Z"),
        ];
        // b and c tie on free slots; c registered earlier.
        assert_eq!(selector.select(&runners).unwrap().id, "c");
    }

    #[test]
    fn test_select_none_when_full() {
        let selector = MostFreeSlots;
        let runners = vec![runner("a", 0, "2026-01-01T00:00:00Z")];
        assert!(selector.select(&runners).is_none());
    }

    #[tokio::test]
    async fn test_registry_liveness() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = RunnerRegistry::new(store.clone());

        registry.register("r1", "10.0.0.2", 4101, 4).await.unwrap();
        assert_eq!(registry.live_runners().await.unwrap().len(), 1);

        // Age the heartbeat out of the window; the runner drops from the
        // live set but stays registered.
        let stale = Runner {
            last_heartbeat_at: (chrono::Utc::now() - chrono::Duration::seconds(120)).to_rfc3339(),
            ..registry.list().await.unwrap().remove(0)
        };
        store.upsert_runner(&stale).await.unwrap();
        assert!(registry.live_runners().await.unwrap().is_empty());
        assert_eq!(registry.list().await.unwrap().len(), 1);
        assert!(registry.get_live("r1").await.unwrap().is_none());

        // A fresh heartbeat revives it.
        registry.heartbeat("r1", 0, 0).await.unwrap();
        assert_eq!(registry.live_runners().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_select_outcomes() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = RunnerRegistry::new(store.clone());

        assert!(matches!(
            registry.select().await.unwrap(),
            SelectOutcome::NoRunners
        ));

        registry.register("r1", "h", 4101, 1).await.unwrap();
        assert!(matches!(
            registry.select().await.unwrap(),
            SelectOutcome::Chosen(_)
        ));

        registry.heartbeat("r1", 1, 0).await.unwrap();
        assert!(matches!(
            registry.select().await.unwrap(),
            SelectOutcome::AllFull
        ));
    }
}
