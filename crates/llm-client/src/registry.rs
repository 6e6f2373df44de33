use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use pipeline_core::{ProviderConfig, ProviderKind};

use crate::client::LlmClient;
use crate::error::{LlmError, LlmResult};
use crate::gemini::GeminiClient;
use crate::openai::OpenAiCompatibleClient;
use crate::rate_limit::ProviderRateLimiter;

/// One lazily built client per configured provider, shared process-wide.
pub struct ProviderRegistry {
    configs: HashMap<String, ProviderConfig>,
    clients: DashMap<String, Arc<dyn LlmClient>>,
}

impl ProviderRegistry {
    pub fn new(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.id.clone(), c)).collect(),
            clients: DashMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Client for `provider_id`, built on first use.
    ///
    /// A provider without an API key yields `LlmError::MissingApiKey` and is
    /// not cached, so a later config reload can still enable it.
    pub fn get(&self, provider_id: &str) -> LlmResult<Arc<dyn LlmClient>> {
        if let Some(client) = self.clients.get(provider_id) {
            return Ok(client.clone());
        }
        let config = self
            .configs
            .get(provider_id)
            .ok_or_else(|| LlmError::UnknownProvider(provider_id.to_string()))?;

        let entry = self
            .clients
            .entry(provider_id.to_string())
            .or_try_insert_with(|| build_client(config))?;
        Ok(entry.value().clone())
    }

    /// Register a prebuilt client, replacing any existing one.
    pub fn insert(&self, client: Arc<dyn LlmClient>) {
        self.clients.insert(client.provider_id().to_string(), client);
    }

    pub fn is_configured(&self, provider_id: &str) -> bool {
        self.configs.contains_key(provider_id) || self.clients.contains_key(provider_id)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.keys().cloned().collect();
        for entry in self.clients.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids.sort();
        ids
    }
}

fn build_client(config: &ProviderConfig) -> LlmResult<Arc<dyn LlmClient>> {
    let limiter = config.qps.and_then(ProviderRateLimiter::new).map(Arc::new);
    tracing::info!(
        provider = %config.id,
        kind = ?config.kind,
        model = %config.model,
        qps = ?config.qps,
        "initializing LLM client"
    );
    let client: Arc<dyn LlmClient> = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiCompatibleClient::new(config, limiter)?),
        ProviderKind::Gemini => Arc::new(GeminiClient::new(config, limiter)?),
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, api_key: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            kind: ProviderKind::OpenAi,
            base_url: "https://api.example.com/v1".into(),
            api_key: api_key.into(),
            model: "m".into(),
            qps: Some(5.0),
            lite: false,
            system_role: true,
            timeout_secs: 30,
        }
    }

    #[test]
    fn clients_are_singletons() {
        let registry = ProviderRegistry::new(vec![config("a", "key")]);
        let first = registry.get("a").unwrap();
        let second = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_key_and_unknown_provider() {
        let registry = ProviderRegistry::new(vec![config("nokey", "")]);
        assert!(matches!(registry.get("nokey"), Err(LlmError::MissingApiKey(_))));
        assert!(matches!(registry.get("other"), Err(LlmError::UnknownProvider(_))));
        assert!(registry.is_configured("nokey"));
        assert_eq!(registry.provider_ids(), vec!["nokey".to_string()]);
    }
}
