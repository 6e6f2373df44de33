use std::sync::Arc;

use dashmap::DashMap;
use llm_client::{LlmError, ProviderRegistry};
use pipeline_core::{PipelineResult, PredictionModel, ProviderKind, SkipReason};
use reasoning_chain::FOUR_STEP;
use sql_store::Store;

use crate::adapter::PredictionAdapter;
use crate::adapters::{ChainAdapter, LlmAdapter, RuleAdapter, SkipAdapter};

/// Turns `prediction_models` rows into adapters.
///
/// Provider tags: `rule`, `chain`, or an LLM transport (`openai`, `gemini`
/// and their aliases). The model's `config.provider_id` names the LLM
/// provider; it defaults to the tag itself.
pub struct AdapterResolver {
    store: Store,
    registry: Arc<ProviderRegistry>,
    overrides: DashMap<String, Arc<dyn PredictionAdapter>>,
}

impl AdapterResolver {
    pub fn new(store: Store, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            registry,
            overrides: DashMap::new(),
        }
    }

    /// Pin a ready-made adapter to a model id, bypassing the provider tag.
    pub fn with_adapter(self, adapter: Arc<dyn PredictionAdapter>) -> Self {
        self.overrides.insert(adapter.model_id().to_string(), adapter);
        self
    }

    pub fn resolve(&self, model: &PredictionModel) -> PipelineResult<Arc<dyn PredictionAdapter>> {
        if let Some(adapter) = self.overrides.get(&model.model_id) {
            return Ok(adapter.clone());
        }

        let tag = model.provider.trim().to_ascii_lowercase();
        let adapter: Arc<dyn PredictionAdapter> = match tag.as_str() {
            "rule" => Arc::new(RuleAdapter::new(&model.model_id)),
            "chain" => {
                let client = match self.client(model) {
                    Ok(client) => client,
                    Err(skip) => return Ok(skip),
                };
                Arc::new(ChainAdapter::new(
                    &model.model_id,
                    model.strategy().unwrap_or(FOUR_STEP),
                    client,
                    self.store.clone(),
                    model.is_lite(),
                ))
            }
            other => match ProviderKind::parse(other) {
                Some(kind) => {
                    let client = match self.client(model) {
                        Ok(client) => client,
                        Err(skip) => return Ok(skip),
                    };
                    let kind = match kind {
                        ProviderKind::OpenAi => "openai",
                        ProviderKind::Gemini => "gemini",
                    };
                    Arc::new(LlmAdapter::new(&model.model_id, kind, client))
                }
                None => Arc::new(SkipAdapter::new(
                    &model.model_id,
                    SkipReason::UnsupportedProvider(model.provider.clone()),
                )),
            },
        };
        Ok(adapter)
    }

    /// The model's LLM client, or a skip adapter explaining why there is none.
    fn client(
        &self,
        model: &PredictionModel,
    ) -> Result<Arc<dyn llm_client::LlmClient>, Arc<dyn PredictionAdapter>> {
        let provider_id = model.provider_id();
        self.registry.get(provider_id).map_err(|e| {
            let reason = match e {
                LlmError::MissingApiKey(p) => SkipReason::MissingApiKey(p),
                LlmError::UnknownProvider(p) => SkipReason::ProviderDisabled(p),
                other => {
                    tracing::warn!(model_id = %model.model_id, provider_id, "provider unavailable: {}", other);
                    SkipReason::ProviderDisabled(provider_id.to_string())
                }
            };
            Arc::new(SkipAdapter::new(&model.model_id, reason)) as Arc<dyn PredictionAdapter>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterOutcome;
    use crate::testing::{analysis_context, model};
    use llm_client::ScriptedClient;
    use pipeline_core::{ProviderConfig, Signal};
    use serde_json::json;

    fn config(id: &str, api_key: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            kind: ProviderKind::OpenAi,
            base_url: "http://localhost:9".into(),
            api_key: api_key.into(),
            model: "m".into(),
            qps: None,
            lite: false,
            system_role: true,
            timeout_secs: 5,
        }
    }

    async fn outcome(resolver: &AdapterResolver, m: &PredictionModel) -> AdapterOutcome {
        resolver
            .resolve(m)
            .unwrap()
            .predict("00700", "2026-01-10", &analysis_context())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rule_models_need_no_provider() {
        let store = Store::in_memory().await.unwrap();
        let resolver = AdapterResolver::new(store, Arc::new(ProviderRegistry::empty()));
        let adapter = resolver.resolve(&model("rule-ma", 10, "rule")).unwrap();
        assert_eq!(adapter.kind(), "rule");
        let AdapterOutcome::Prediction(out) = outcome(&resolver, &model("rule-ma", 10, "rule")).await else {
            panic!("rule adapter should predict");
        };
        assert_eq!(out.payload.signal, Signal::Long);
    }

    #[tokio::test]
    async fn missing_credentials_become_skips() {
        let store = Store::in_memory().await.unwrap();
        let registry = Arc::new(ProviderRegistry::new(vec![config("deepseek", "")]));
        let resolver = AdapterResolver::new(store, registry);

        let mut keyless = model("ds-v3", 50, "openai");
        keyless.config = json!({"provider_id": "deepseek"});
        assert_eq!(
            outcome(&resolver, &keyless).await,
            AdapterOutcome::Skip(SkipReason::MissingApiKey("deepseek".into()))
        );

        let unknown = model("qwen", 40, "openai");
        assert_eq!(
            outcome(&resolver, &unknown).await,
            AdapterOutcome::Skip(SkipReason::ProviderDisabled("openai".into()))
        );

        let odd = model("odd", 1, "carrier-pigeon");
        assert_eq!(
            outcome(&resolver, &odd).await,
            AdapterOutcome::Skip(SkipReason::UnsupportedProvider("carrier-pigeon".into()))
        );
    }

    #[tokio::test]
    async fn chain_models_use_registered_client() {
        let store = Store::in_memory().await.unwrap();
        let registry = Arc::new(ProviderRegistry::empty());
        registry.insert(Arc::new(ScriptedClient::repeating("gemini-flash", "{}")));
        let resolver = AdapterResolver::new(store, registry);

        let mut chain = model("chain-flash", 80, "chain");
        chain.config = json!({"provider_id": "gemini-flash", "strategy": "four_step", "lite": true});
        assert_eq!(resolver.resolve(&chain).unwrap().kind(), "chain");
    }
}
