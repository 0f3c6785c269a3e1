use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// External generative-AI image backend. Each provider speaks its own wire
/// protocol and carries its own model catalog and mask convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
        }
    }

    pub fn all() -> [Provider; 2] {
        [Provider::Gemini, Provider::OpenAi]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::OpenAi),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: Provider,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Per-provider model catalog. Order matters: the first entry for a provider
/// is that provider's default model.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn for_provider(&self, provider: Provider) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider)
            .cloned()
            .collect()
    }

    pub fn default_for(&self, provider: Provider) -> Option<ModelSpec> {
        self.models
            .values()
            .find(|model| model.provider == provider)
            .cloned()
    }

    pub fn contains(&self, provider: Provider, name: &str) -> bool {
        self.get(name)
            .map(|model| model.provider == provider)
            .unwrap_or(false)
    }

    /// Model to use for `provider` when `requested` is absent from the
    /// catalog or belongs to another provider.
    pub fn resolve(&self, provider: Provider, requested: &str) -> Option<ModelSpec> {
        if self.contains(provider, requested) {
            return self.get(requested).cloned();
        }
        self.default_for(provider)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: Provider, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider,
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("gemini-2.5-flash-image", Provider::Gemini, &["image"]);
    insert("dall-e-3", Provider::OpenAi, &["image"]);
    insert("dall-e-2", Provider::OpenAi, &["image", "edit"]);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_first_catalog_entry_for_provider() {
        let catalog = ModelCatalog::default();
        assert_eq!(
            catalog.default_for(Provider::Gemini).map(|m| m.name),
            Some("gemini-2.5-flash-image".to_string())
        );
        assert_eq!(
            catalog.default_for(Provider::OpenAi).map(|m| m.name),
            Some("dall-e-3".to_string())
        );
    }

    #[test]
    fn resolve_falls_back_to_provider_default() {
        let catalog = ModelCatalog::default();
        let resolved = catalog.resolve(Provider::OpenAi, "gemini-2.5-flash-image");
        assert_eq!(resolved.map(|m| m.name), Some("dall-e-3".to_string()));
    }

    #[test]
    fn edit_capability_marks_region_editing_models() {
        let catalog = ModelCatalog::default();
        assert!(catalog.get("dall-e-2").map(|m| m.supports("edit")).unwrap());
        assert!(!catalog.get("dall-e-3").map(|m| m.supports("edit")).unwrap());
    }

    #[test]
    fn provider_is_totally_ordered_for_map_keys() {
        let mut providers = vec![Provider::OpenAi, Provider::Gemini];
        providers.sort();
        assert_eq!(providers, vec![Provider::Gemini, Provider::OpenAi]);
    }

    #[test]
    fn provider_round_trips_through_str() {
        for provider in Provider::all() {
            assert_eq!(provider.as_str().parse::<Provider>().ok(), Some(provider));
        }
        assert!("dalle".parse::<Provider>().is_err());
    }
}
