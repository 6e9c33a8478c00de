//! Per-group video/image toggle, persisted in a key-value store.
use crate::db::{self, Pool};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Store `new` only if the key currently holds `expected` (`None` = absent).
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool>;
}

/// Key-value store backed by the `kv_store` table.
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: Pool,
}

impl SqliteKvStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        db::kv_get(&self.pool, key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        db::kv_set(&self.pool, key, value).await
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        db::kv_compare_and_swap(&self.pool, key, expected, new).await
    }
}

/// Process-local store, for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.inner.lock().map_err(|_| anyhow!("kv store poisoned"))?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.inner.lock().map_err(|_| anyhow!("kv store poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let mut map = self.inner.lock().map_err(|_| anyhow!("kv store poisoned"))?;
        if map.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        map.insert(key.to_string(), new.to_string());
        Ok(true)
    }
}

/// Decides image vs. video for each run of a group and alternates it.
///
/// The stored value is the decision the *next* call will return.
#[derive(Clone)]
pub struct BatchTypeStore {
    kv: Arc<dyn KeyValueStore>,
    rng: Arc<Mutex<StdRng>>,
}

impl BatchTypeStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_seed(kv: Arc<dyn KeyValueStore>, seed: u64) -> Self {
        Self {
            kv,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn key_for(group: &str) -> String {
        format!("batchType:{}", group)
    }

    fn coin(&self) -> Result<bool> {
        let mut rng = self.rng.lock().map_err(|_| anyhow!("rng poisoned"))?;
        Ok(rng.gen::<f64>() < 0.5)
    }

    /// Return this run's decision (`true` = video) and store its negation.
    /// Absent state starts from a fair coin flip.
    #[instrument(skip(self))]
    pub async fn get_and_toggle(&self, group: &str) -> Result<bool> {
        let key = Self::key_for(group);
        loop {
            let current = self.kv.get(&key).await?;
            let decision = match current.as_deref() {
                None => self.coin()?,
                Some(v) => parse_flag(v)?,
            };
            let next = if decision { "false" } else { "true" };
            if self
                .kv
                .compare_and_swap(&key, current.as_deref(), next)
                .await?
            {
                debug!(group, decision, "batch type decided");
                return Ok(decision);
            }
            debug!(group, "batch type changed concurrently; retrying");
        }
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(anyhow!("corrupt batch type value {:?}", other)),
    }
}
