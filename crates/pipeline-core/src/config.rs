use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::calendar::MarketClock;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbSource {
    /// Remote libSQL service over HTTP.
    Cloud,
    /// Embedded SQLite file.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai_compatible" | "deepseek" | "qwen" => Some(ProviderKind::OpenAi),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

/// Connection settings for one LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Empty means "not configured"; adapters turn that into a skip.
    pub api_key: String,
    pub model: String,
    pub qps: Option<f64>,
    pub lite: bool,
    pub system_role: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // Storage
    pub db_source: DbSource,
    pub database_url: String,
    pub cloud_db_url: Option<String>,
    pub cloud_db_token: Option<String>,

    // LLM providers
    pub providers: Vec<ProviderConfig>,
    pub brief_provider_free: Option<String>,
    pub brief_provider_pro: Option<String>,

    // Validation
    pub noise_threshold: f64,
    pub market_tz: String,

    // Notifications
    pub notification_secret: Option<String>,
    pub push_api_url: Option<String>,
    pub app_base_url: String,
    pub notification_dry_run: bool,
    pub notification_lang: String,

    // News
    pub news_api_url: Option<String>,
    pub news_api_key: Option<String>,

    // Concurrency ceilings
    pub analysis_concurrency: usize,
    pub brief_concurrency: usize,
    pub price_sync_concurrency: usize,
    pub model_filter: Option<Vec<String>>,

    pub task_agent_id: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let db_source = match or("DB_SOURCE", "local").to_ascii_lowercase().as_str() {
            "cloud" => DbSource::Cloud,
            "local" => DbSource::Local,
            other => {
                return Err(PipelineError::Config(format!(
                    "DB_SOURCE must be cloud or local, got '{}'",
                    other
                )))
            }
        };

        let mut providers = Vec::new();
        if let Some(list) = get("LLM_PROVIDERS") {
            for id in split_list(&list) {
                providers.push(provider_from_lookup(&id, &get)?);
            }
        }

        let market_tz = or("MARKET_TZ", "+08:00");
        MarketClock::parse(&market_tz)?;

        let config = Self {
            db_source,
            database_url: or("DATABASE_URL", "sqlite:stock_brief.db?mode=rwc"),
            cloud_db_url: get("CLOUD_DB_URL"),
            cloud_db_token: get("CLOUD_DB_TOKEN"),

            providers,
            brief_provider_free: get("BRIEF_PROVIDER_FREE"),
            brief_provider_pro: get("BRIEF_PROVIDER_PRO"),

            noise_threshold: parse_var("NOISE_THRESHOLD", &or("NOISE_THRESHOLD", "1.0"))?,
            market_tz,

            notification_secret: get("NOTIFICATION_SECRET"),
            push_api_url: get("PUSH_API_URL"),
            app_base_url: or("APP_BASE_URL", "http://localhost:3000"),
            notification_dry_run: parse_bool(&or("NOTIFICATION_DRY_RUN", "false")),
            notification_lang: or("NOTIFICATION_LANG", "zh"),

            news_api_url: get("NEWS_API_URL"),
            news_api_key: get("NEWS_API_KEY"),

            analysis_concurrency: parse_var("ANALYSIS_CONCURRENCY", &or("ANALYSIS_CONCURRENCY", "4"))?,
            brief_concurrency: parse_var("BRIEF_CONCURRENCY", &or("BRIEF_CONCURRENCY", "4"))?,
            price_sync_concurrency: parse_var(
                "PRICE_SYNC_CONCURRENCY",
                &or("PRICE_SYNC_CONCURRENCY", "2"),
            )?,
            model_filter: get("MODEL_FILTER").map(|v| split_list(&v)),

            task_agent_id: or("TASK_AGENT_ID", "daily-runner"),
        };

        if config.db_source == DbSource::Cloud && config.cloud_db_url.is_none() {
            return Err(PipelineError::Config(
                "DB_SOURCE=cloud requires CLOUD_DB_URL".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn clock(&self) -> MarketClock {
        MarketClock::parse(&self.market_tz).unwrap_or_default()
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

fn provider_from_lookup<G>(id: &str, get: &G) -> Result<ProviderConfig, PipelineError>
where
    G: Fn(&str) -> Option<String>,
{
    let prefix = format!("LLM_{}_", id.to_ascii_uppercase().replace('-', "_"));
    let key = |suffix: &str| format!("{}{}", prefix, suffix);

    let kind_raw = get(&key("KIND")).unwrap_or_else(|| "openai".to_string());
    let kind = ProviderKind::parse(&kind_raw).ok_or_else(|| {
        PipelineError::Config(format!("{} has unknown kind '{}'", key("KIND"), kind_raw))
    })?;

    let default_base = match kind {
        ProviderKind::OpenAi => "https://api.openai.com/v1",
        ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
    };

    let qps = match get(&key("QPS")) {
        Some(raw) => Some(parse_var(&key("QPS"), &raw)?),
        None => None,
    };

    Ok(ProviderConfig {
        id: id.to_string(),
        kind,
        base_url: get(&key("BASE_URL")).unwrap_or_else(|| default_base.to_string()),
        api_key: get(&key("API_KEY")).unwrap_or_default(),
        model: get(&key("MODEL")).unwrap_or_default(),
        qps,
        lite: get(&key("LITE")).map(|v| parse_bool(&v)).unwrap_or(false),
        system_role: get(&key("SYSTEM_ROLE"))
            .map(|v| parse_bool(&v))
            .unwrap_or(true),
        timeout_secs: match get(&key("TIMEOUT_SECS")) {
            Some(raw) => parse_var(&key("TIMEOUT_SECS"), &raw)?,
            None => 120,
        },
    })
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, PipelineError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PipelineError::Config(format!("{}='{}': {}", key, raw, e)))
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.db_source, DbSource::Local);
        assert_eq!(cfg.noise_threshold, 1.0);
        assert_eq!(cfg.market_tz, "+08:00");
        assert_eq!(cfg.brief_concurrency, 4);
        assert_eq!(cfg.price_sync_concurrency, 2);
        assert_eq!(cfg.notification_lang, "zh");
        assert!(!cfg.notification_dry_run);
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn providers_are_read_per_id() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("LLM_PROVIDERS", "deepseek, gemini-flash"),
            ("LLM_DEEPSEEK_BASE_URL", "https://api.deepseek.com/v1"),
            ("LLM_DEEPSEEK_API_KEY", "sk-test"),
            ("LLM_DEEPSEEK_MODEL", "deepseek-chat"),
            ("LLM_GEMINI_FLASH_KIND", "gemini"),
            ("LLM_GEMINI_FLASH_QPS", "0.5"),
            ("LLM_GEMINI_FLASH_LITE", "true"),
            ("LLM_GEMINI_FLASH_SYSTEM_ROLE", "false"),
        ]))
        .unwrap();
        assert_eq!(cfg.providers.len(), 2);
        let ds = cfg.provider("deepseek").unwrap();
        assert_eq!(ds.kind, ProviderKind::OpenAi);
        assert_eq!(ds.timeout_secs, 120);
        let gem = cfg.provider("gemini-flash").unwrap();
        assert_eq!(gem.kind, ProviderKind::Gemini);
        assert_eq!(gem.qps, Some(0.5));
        assert!(gem.lite);
        assert!(!gem.system_role);
        assert!(gem.api_key.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(PipelineConfig::from_lookup(lookup(&[("DB_SOURCE", "mysql")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("DB_SOURCE", "cloud")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("NOISE_THRESHOLD", "abc")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("MARKET_TZ", "Asia/Shanghai")])).is_err());
    }
}
