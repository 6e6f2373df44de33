use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use brief_pipeline::{BriefAssembler, HttpNewsProvider, StockAnalyzer};
use llm_client::ProviderRegistry;
use notification_service::{Dispatcher, HttpPushTransport, NotificationError, PushPayload, PushTransport};
use pipeline_core::{PipelineConfig, TradingCalendar, WeekdayCalendar};
use prediction_engine::{AdapterResolver, ContextBuilder, PredictionRacer, Validator};
use sql_store::Store;
use task_logger::{DailyPlan, TaskLogger};

/// Stands in when `PUSH_API_URL` is unset; the dispatcher runs dry so it is
/// never called.
struct UnconfiguredPush;

#[async_trait]
impl PushTransport for UnconfiguredPush {
    async fn push(&self, _payload: &PushPayload) -> Result<(), NotificationError> {
        Err(NotificationError::Config("PUSH_API_URL is not set".into()))
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}

/// Process-wide handles shared by every job.
pub struct App {
    pub config: PipelineConfig,
    pub store: Store,
    pub registry: Arc<ProviderRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub calendar: Arc<dyn TradingCalendar>,
    pub plan: DailyPlan,
}

impl App {
    pub async fn build(config: PipelineConfig, dry_run: bool) -> Result<Self> {
        let store = Store::connect(&config).await.context("opening store")?;
        let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
        tracing::info!(providers = ?registry.provider_ids(), "LLM providers configured");

        let (transport, dry_run): (Arc<dyn PushTransport>, bool) = match &config.push_api_url {
            Some(url) => (
                Arc::new(HttpPushTransport::new(url.clone(), config.notification_secret.clone())?),
                dry_run || config.notification_dry_run,
            ),
            None => {
                tracing::warn!("PUSH_API_URL not set, notifications are logged only");
                (Arc::new(UnconfiguredPush), true)
            }
        };
        let dispatcher = Arc::new(
            Dispatcher::new(store.clone(), transport, config.app_base_url.clone())
                .with_lang(config.notification_lang.clone())
                .with_dry_run(dry_run),
        );

        let plan = DailyPlan::standard(&config.task_agent_id);
        Ok(Self {
            config,
            store,
            registry,
            dispatcher,
            calendar: Arc::new(WeekdayCalendar::new()),
            plan,
        })
    }

    /// Logger for a planned task, owned by the agent the plan names.
    pub fn logger(&self, task_name: &str, date: &str) -> TaskLogger {
        let agent = self
            .plan
            .get(task_name)
            .map(|t| t.agent_id.as_str())
            .unwrap_or(&self.config.task_agent_id);
        TaskLogger::new(self.store.clone(), agent, task_name, date).triggered_by("daily-runner")
    }

    pub fn racer(&self) -> Arc<PredictionRacer> {
        let contexts = Arc::new(ContextBuilder::new(self.store.clone()));
        let resolver = AdapterResolver::new(self.store.clone(), self.registry.clone());
        Arc::new(
            PredictionRacer::new(self.store.clone(), contexts, resolver, self.calendar.clone())
                .with_model_filter(self.config.model_filter.clone()),
        )
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.store.clone(), self.config.noise_threshold)
    }

    /// Brief providers fall back to the first configured provider.
    pub fn analyzer(&self) -> Result<Arc<StockAnalyzer>> {
        let fallback = self.config.providers.first().map(|p| p.id.clone());
        let free = self
            .config
            .brief_provider_free
            .clone()
            .or_else(|| fallback.clone())
            .context("no LLM provider configured for free briefs")?;
        let pro = self
            .config
            .brief_provider_pro
            .clone()
            .or(fallback)
            .context("no LLM provider configured for pro briefs")?;

        let mut analyzer = StockAnalyzer::new(self.store.clone(), self.registry.clone(), free, pro);
        match &self.config.news_api_url {
            Some(url) => {
                let news = HttpNewsProvider::new(url.clone(), self.config.news_api_key.clone())?;
                analyzer = analyzer.with_news(Arc::new(news));
            }
            None => tracing::warn!("NEWS_API_URL not set, briefs are written without news"),
        }
        Ok(Arc::new(analyzer))
    }

    pub fn assembler(&self) -> BriefAssembler {
        BriefAssembler::new(self.store.clone()).with_dispatcher(self.dispatcher.clone())
    }
}
