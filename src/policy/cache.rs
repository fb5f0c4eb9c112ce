use super::model::{ApiDefinition, Strategy};
use super::store::{PolicyBatch, PolicyStore};
use crate::config::PolicyConfig;
use crate::error::Result;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which rows a cache keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    /// APIs and strategies (gateway)
    Full,
    /// Strategies only (limiter replica)
    StrategiesOnly,
}

/// Immutable view of all policies, shared by every request that grabbed it
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    apis: HashMap<String, Arc<ApiDefinition>>,
    strategies: HashMap<i64, Arc<Strategy>>,
}

impl PolicySnapshot {
    pub fn api(&self, api_id: &str) -> Option<&Arc<ApiDefinition>> {
        self.apis.get(api_id)
    }

    pub fn strategy(&self, id: i64) -> Option<&Arc<Strategy>> {
        self.strategies.get(&id)
    }

    /// Strategy that is known and switched on; id `0` is never active
    pub fn active_strategy(&self, id: i64) -> Option<&Arc<Strategy>> {
        if id == super::model::NO_STRATEGY {
            return None;
        }
        self.strategy(id).filter(|s| s.is_on())
    }

    pub fn api_count(&self) -> usize {
        self.apis.len()
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }
}

/// Concurrently readable policy cache. Writers build a new snapshot and swap it in.
pub struct PolicyCache {
    scope: CacheScope,
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyCache {
    pub fn new(scope: CacheScope) -> Self {
        Self {
            scope,
            current: RwLock::new(Arc::new(PolicySnapshot::default())),
        }
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    /// Current snapshot; hold it for the whole request
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    /// Replace everything with `batch`. Rows missing from it are evicted.
    pub fn replace(&self, batch: PolicyBatch) {
        let mut next = PolicySnapshot::default();
        self.apply(&mut next, batch);

        let (apis, strategies) = (next.apis.len(), next.strategies.len());
        *self.current.write() = Arc::new(next);
        debug!(apis, strategies, "Policy snapshot replaced");
    }

    /// Upsert the rows of `batch`, keeping everything else
    pub fn merge(&self, batch: PolicyBatch) -> usize {
        let changed = batch.strategies.len()
            + match self.scope {
                CacheScope::Full => batch.apis.len(),
                CacheScope::StrategiesOnly => 0,
            };
        if changed == 0 {
            return 0;
        }

        let current = self.snapshot();
        let mut next = PolicySnapshot {
            apis: current.apis.clone(),
            strategies: current.strategies.clone(),
        };
        self.apply(&mut next, batch);

        *self.current.write() = Arc::new(next);
        changed
    }

    /// Full reload from `store`
    pub async fn load_from(&self, store: &dyn PolicyStore) -> Result<()> {
        let batch = store.load_all().await?;
        self.replace(batch);

        let snapshot = self.snapshot();
        info!(
            apis = snapshot.api_count(),
            strategies = snapshot.strategy_count(),
            "Policies loaded"
        );
        Ok(())
    }

    fn apply(&self, target: &mut PolicySnapshot, batch: PolicyBatch) {
        if self.scope == CacheScope::Full {
            for record in &batch.apis {
                let api = ApiDefinition::from_record(record);
                target.apis.insert(api.api_id.clone(), Arc::new(api));
            }
        }

        for record in &batch.strategies {
            match Strategy::from_record(record) {
                Ok(strategy) => {
                    target.strategies.insert(strategy.id, Arc::new(strategy));
                }
                Err(e) => {
                    // Drop any older version so the defaults apply
                    target.strategies.remove(&record.id);
                    warn!(strategy_id = record.id, error = %e, "Skipping undecodable strategy");
                }
            }
        }
    }
}

/// Periodic cache refresh task
pub struct PolicyRefresher {
    cache: Arc<PolicyCache>,
    store: Arc<dyn PolicyStore>,
    interval: Duration,
    grace: chrono::Duration,
    full_resync_every: u32,
}

impl PolicyRefresher {
    pub fn new(cache: Arc<PolicyCache>, store: Arc<dyn PolicyStore>, config: &PolicyConfig) -> Self {
        Self {
            cache,
            store,
            interval: config.refresh_interval(),
            grace: config.grace(),
            full_resync_every: config.full_resync_every,
        }
    }

    /// Run until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut last_poll = Utc::now();
            let mut ticks: u32 = 0;

            info!(
                interval_secs = self.interval.as_secs(),
                full_resync_every = self.full_resync_every,
                "Policy refresher started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Policy refresher received cancel signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        ticks = ticks.wrapping_add(1);
                        let now = Utc::now();

                        if self.full_resync_every > 0 && ticks % self.full_resync_every == 0 {
                            match self.cache.load_from(self.store.as_ref()).await {
                                Ok(()) => last_poll = now,
                                Err(e) => warn!(error = %e, "Full policy resync failed"),
                            }
                            continue;
                        }

                        match self.store.load_since(last_poll - self.grace).await {
                            Ok(batch) => {
                                let changed = self.cache.merge(batch);
                                if changed > 0 {
                                    info!(changed, "Policies refreshed");
                                }
                                last_poll = now;
                            }
                            Err(e) => warn!(error = %e, "Incremental policy refresh failed"),
                        }
                    }
                }
            }
        })
    }
}
