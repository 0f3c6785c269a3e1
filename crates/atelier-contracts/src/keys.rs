use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::Provider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveKey {
    pub provider: Provider,
    pub key: String,
}

/// Outcome of a bulk key-addition batch: which candidates survived their
/// validation probe and which did not. Purely informational, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyAddReport {
    pub added: Vec<String>,
    pub failed: Vec<String>,
}

/// Ordered per-provider secret store plus a single active pointer.
///
/// Invariants: keys are unique within a provider, and the active pointer,
/// when present, references a key actually held in that provider's pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyPool {
    #[serde(default)]
    keys: BTreeMap<Provider, Vec<String>>,
    #[serde(default)]
    active: Option<ActiveKey>,
}

impl ApiKeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys_for(&self, provider: Provider) -> &[String] {
        self.keys
            .get(&provider)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, provider: Provider, key: &str) -> bool {
        self.keys_for(provider).iter().any(|item| item == key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.values().all(Vec::is_empty)
    }

    pub fn active(&self) -> Option<&ActiveKey> {
        self.active.as_ref()
    }

    /// Adds the given candidates for `provider`, skipping duplicates, and
    /// returns the keys that were actually inserted. If no key was active
    /// before, the first inserted key becomes active.
    pub fn add_keys<I>(&mut self, provider: Provider, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut inserted = Vec::new();
        for candidate in candidates {
            let trimmed = candidate.trim().to_string();
            if trimmed.is_empty() || self.contains(provider, &trimmed) {
                continue;
            }
            self.keys.entry(provider).or_default().push(trimmed.clone());
            inserted.push(trimmed);
        }
        if self.active.is_none() {
            if let Some(first) = inserted.first() {
                self.active = Some(ActiveKey {
                    provider,
                    key: first.clone(),
                });
            }
        }
        inserted
    }

    /// Removes a key. If the active pointer referenced it, the pointer is
    /// re-aimed at the first remaining key for the same provider, or cleared
    /// when that pool is now empty.
    pub fn remove_key(&mut self, provider: Provider, key: &str) -> bool {
        let Some(pool) = self.keys.get_mut(&provider) else {
            return false;
        };
        let before = pool.len();
        pool.retain(|item| item != key);
        let removed = pool.len() != before;
        if removed && self.active_matches(provider, key) {
            self.active = self
                .keys_for(provider)
                .first()
                .map(|remaining| ActiveKey {
                    provider,
                    key: remaining.clone(),
                });
        }
        removed
    }

    pub fn set_active(&mut self, provider: Provider, key: &str) -> Result<()> {
        if !self.contains(provider, key) {
            bail!("key is not in the {provider} pool");
        }
        self.active = Some(ActiveKey {
            provider,
            key: key.to_string(),
        });
        Ok(())
    }

    /// Resolves a key for `provider`: the active pointer when it matches,
    /// otherwise the first pooled key — promoting it to active so subsequent
    /// requests stay consistent. Returns `None` without touching the pointer
    /// when no key is pooled for that provider.
    pub fn select_for(&mut self, provider: Provider) -> Option<String> {
        if let Some(active) = &self.active {
            if active.provider == provider && self.contains(provider, &active.key) {
                return Some(active.key.clone());
            }
        }
        let fallback = self.keys_for(provider).first().cloned()?;
        self.active = Some(ActiveKey {
            provider,
            key: fallback.clone(),
        });
        Some(fallback)
    }

    fn active_matches(&self, provider: Provider, key: &str) -> bool {
        self.active
            .as_ref()
            .map(|active| active.provider == provider && active.key == key)
            .unwrap_or(false)
    }
}
