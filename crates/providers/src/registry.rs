use std::collections::HashMap;
use std::sync::Arc;

use crate::ProviderAdapter;

/// Provider id → adapter, resolved once at startup. Adding a provider
/// means registering a new implementation here, not branching on type.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in adapters.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::OpenAiAdapter::new()));
        registry.register(Arc::new(crate::AnthropicAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.adapters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_by_provider_id() {
        let registry = AdapterRegistry::with_builtin();
        assert!(registry.get("openai").is_some());
        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("groq").is_none());
        assert_eq!(registry.providers(), vec!["anthropic", "openai"]);
    }
}
