// crates/quorum-engines/src/registry.rs

//! Adapter registry: `{model_id → (adapter, config)}` with priority,
//! tag, and capability lookups.

use crate::adapter::LlmAdapter;
use anyhow::{anyhow, Result};
use log::{debug, warn};
use quorum_core::config::ModelConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One registered backend.
#[derive(Clone)]
pub struct Registration {
    pub adapter: Arc<dyn LlmAdapter>,
    pub config: ModelConfig,
}

/// Registry of callable backends.
///
/// Registration is idempotent and replaces existing entries. Reads clone the
/// `Arc`s out under a short read lock; no lock is ever held across an await.
#[derive(Default)]
pub struct AdapterRegistry {
    inner: RwLock<HashMap<String, Registration>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `config.model_id`.
    ///
    /// At most one entry may be primary: registering a new primary demotes
    /// the previous one.
    pub fn register(&self, config: ModelConfig, adapter: Arc<dyn LlmAdapter>) -> Result<()> {
        config.validate()?;
        let id = config.model_id.clone();

        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("adapter registry lock poisoned"))?;

        if config.is_primary {
            for (other_id, other) in inner.iter_mut() {
                if other.config.is_primary && *other_id != id {
                    debug!("demoting previous primary model {}", other_id);
                    other.config.is_primary = false;
                }
            }
        }

        if inner.insert(id.clone(), Registration { adapter, config }).is_some() {
            warn!("replacing existing registration for {}", id);
        }
        Ok(())
    }

    pub fn deregister(&self, id: &str) -> bool {
        self.inner
            .write()
            .map(|mut inner| inner.remove(id).is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<Registration> {
        self.inner.read().ok()?.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().map(|inner| inner.contains_key(id)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered ids, alphabetical.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Ids of models carrying the given tag, alphabetical.
    pub fn list_by_tag(&self, tag: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .map(|inner| {
                inner
                    .values()
                    .filter(|reg| reg.config.tags.contains(tag))
                    .map(|reg| reg.config.model_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Ids of models whose capability named `capability` equals `value`.
    ///
    /// Recognised names: `streaming`, `embeddings`, `vision`.
    pub fn list_by_capability(&self, capability: &str, value: bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .map(|inner| {
                inner
                    .values()
                    .filter(|reg| {
                        let caps = reg.adapter.capabilities();
                        let actual = match capability {
                            "streaming" => caps.supports_streaming,
                            "embeddings" => caps.supports_embeddings,
                            "vision" => caps.supports_vision,
                            _ => return false,
                        };
                        actual == value
                    })
                    .map(|reg| reg.config.model_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Ids ordered by weight descending; ties break alphabetically so the
    /// ordering is deterministic.
    ///
    /// When `subset` is given, only those ids are considered (unknown ids
    /// are dropped).
    pub fn prioritized(&self, subset: Option<&[String]>) -> Vec<String> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut entries: Vec<(String, f64)> = match subset {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.get(id).map(|reg| (id.clone(), reg.config.weight)))
                .collect(),
            None => inner
                .values()
                .map(|reg| (reg.config.model_id.clone(), reg.config.weight))
                .collect(),
        };
        entries.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        entries.into_iter().map(|(id, _)| id).collect()
    }

    /// Adjust a model's weight in place.
    pub fn set_weight(&self, id: &str, weight: f64) -> Result<()> {
        if weight < 0.0 {
            return Err(anyhow!("weight must be non-negative, got {}", weight));
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("adapter registry lock poisoned"))?;
        match inner.get_mut(id) {
            Some(reg) => {
                reg.config.weight = weight;
                Ok(())
            }
            None => Err(anyhow!("unknown model: {}", id)),
        }
    }

    /// The designated synthesis model, if one is marked primary.
    pub fn primary(&self) -> Option<String> {
        self.inner
            .read()
            .ok()?
            .values()
            .find(|reg| reg.config.is_primary)
            .map(|reg| reg.config.model_id.clone())
    }

    /// Ids of models whose adapters report themselves available.
    pub fn available(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .map(|inner| {
                inner
                    .values()
                    .filter(|reg| reg.adapter.is_available())
                    .map(|reg| reg.config.model_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
