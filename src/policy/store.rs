use super::model::{ApiRecord, StrategyRecord};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Raw rows returned by one store query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyBatch {
    #[serde(default)]
    pub apis: Vec<ApiRecord>,
    #[serde(default)]
    pub strategies: Vec<StrategyRecord>,
}

impl PolicyBatch {
    fn modified_since(self, since: DateTime<Utc>) -> Self {
        Self {
            apis: self
                .apis
                .into_iter()
                .filter(|a| a.modify_date >= since)
                .collect(),
            strategies: self
                .strategies
                .into_iter()
                .filter(|s| s.modify_date >= since)
                .collect(),
        }
    }
}

impl PolicyBatch {
    fn stamp_undated(&mut self, date: DateTime<Utc>) {
        let undated = DateTime::<Utc>::UNIX_EPOCH;
        for api in self.apis.iter_mut().filter(|a| a.modify_date == undated) {
            api.modify_date = date;
        }
        for strategy in self.strategies.iter_mut().filter(|s| s.modify_date == undated) {
            strategy.modify_date = date;
        }
    }
}

/// Source of API definitions and strategies
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Every row
    async fn load_all(&self) -> Result<PolicyBatch>;

    /// Rows modified at or after `since`
    async fn load_since(&self, since: DateTime<Utc>) -> Result<PolicyBatch>;
}

/// YAML document with `apis:` and `strategies:` lists, re-read on every query.
///
/// Rows without a `modify_date` take the file's modification time, so an edit
/// to them is seen by the next incremental refresh.
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read(&self) -> Result<PolicyBatch> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::Store(format!("Failed to read {}: {}", self.path.display(), e))
        })?;

        if raw.trim().is_empty() {
            return Ok(PolicyBatch::default());
        }

        let mut batch: PolicyBatch = serde_yaml::from_str(&raw).map_err(|e| {
            GatewayError::Store(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;

        if let Some(mtime) = self.modified_at().await {
            batch.stamp_undated(mtime);
        }

        debug!(
            path = %self.path.display(),
            apis = batch.apis.len(),
            strategies = batch.strategies.len(),
            "Read policy file"
        );

        Ok(batch)
    }

    async fn modified_at(&self) -> Option<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        metadata.modified().ok().map(DateTime::<Utc>::from)
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn load_all(&self) -> Result<PolicyBatch> {
        self.read().await
    }

    async fn load_since(&self, since: DateTime<Utc>) -> Result<PolicyBatch> {
        Ok(self.read().await?.modified_since(since))
    }
}

/// In-process store; every write stamps the row with the current time
#[derive(Default)]
pub struct MemoryPolicyStore {
    apis: RwLock<BTreeMap<String, ApiRecord>>,
    strategies: RwLock<BTreeMap<i64, StrategyRecord>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_api(&self, mut api: ApiRecord) {
        api.modify_date = Utc::now();
        self.apis.write().insert(api.api_id.clone(), api);
    }

    pub fn upsert_strategy(&self, mut strategy: StrategyRecord) {
        strategy.modify_date = Utc::now();
        self.strategies.write().insert(strategy.id, strategy);
    }

    pub fn remove_api(&self, api_id: &str) -> Option<ApiRecord> {
        self.apis.write().remove(api_id)
    }

    pub fn remove_strategy(&self, id: i64) -> Option<StrategyRecord> {
        self.strategies.write().remove(&id)
    }

    fn snapshot(&self) -> PolicyBatch {
        PolicyBatch {
            apis: self.apis.read().values().cloned().collect(),
            strategies: self.strategies.read().values().cloned().collect(),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load_all(&self) -> Result<PolicyBatch> {
        Ok(self.snapshot())
    }

    async fn load_since(&self, since: DateTime<Utc>) -> Result<PolicyBatch> {
        Ok(self.snapshot().modified_since(since))
    }
}
