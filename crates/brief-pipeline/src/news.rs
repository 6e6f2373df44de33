use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as Days;
use pipeline_core::calendar::parse_date;
use pipeline_core::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

pub const NEWS_ATTEMPTS: usize = 3;
pub const NEWS_WINDOW_DAYS: i64 = 5;
pub const NEWS_LIMIT: usize = 5;
const NEWS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source: String,
    /// RFC 3339 or `YYYY-MM-DD`; only the date part is used.
    pub published_at: String,
    #[serde(default)]
    pub url: String,
}

impl NewsArticle {
    fn published_date(&self) -> Option<chrono::NaiveDate> {
        self.published_at.get(..10).and_then(|d| parse_date(d).ok())
    }
}

#[async_trait]
pub trait NewsProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<NewsArticle>>;
    fn name(&self) -> &str;
}

/// JSON news search API: `GET {base}?q=..&limit=..&apiKey=..` returning
/// `{"results": [{title, description, source, published_utc, article_url}]}`.
pub struct HttpNewsProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    results: Vec<NewsResult>,
}

#[derive(Debug, Deserialize)]
struct NewsResult {
    title: String,
    description: Option<String>,
    source: Option<String>,
    published_utc: String,
    article_url: Option<String>,
}

impl HttpNewsProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(NEWS_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Config(format!("news client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl NewsProvider for HttpNewsProvider {
    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<NewsArticle>> {
        let mut params = vec![("q", query.to_string()), ("limit", limit.to_string())];
        if let Some(key) = &self.api_key {
            params.push(("apiKey", key.clone()));
        }
        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| PipelineError::ProviderTransient(format!("news request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("news HTTP {}: {}", status, body);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                PipelineError::ProviderTransient(msg)
            } else {
                PipelineError::ProviderFatal(msg)
            });
        }

        let parsed: NewsResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Parse(format!("news body: {}", e)))?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| NewsArticle {
                title: r.title,
                summary: r.description.unwrap_or_default(),
                source: r.source.unwrap_or_default(),
                published_at: r.published_utc,
                url: r.article_url.unwrap_or_default(),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "http-news"
    }
}

/// Title mentions the stock, published within the five days ending on
/// `target_date`, newest first, at most five.
pub fn filter_news(
    articles: Vec<NewsArticle>,
    symbol: &str,
    name: &str,
    target_date: &str,
) -> Vec<NewsArticle> {
    let Ok(end) = parse_date(target_date) else {
        return Vec::new();
    };
    let start = end - Days::days(NEWS_WINDOW_DAYS);

    let mut kept: Vec<NewsArticle> = articles
        .into_iter()
        .filter(|a| a.title.contains(symbol) || (!name.is_empty() && a.title.contains(name)))
        .filter(|a| a.published_date().is_some_and(|d| d >= start && d <= end))
        .collect();
    kept.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    kept.truncate(NEWS_LIMIT);
    kept
}

/// Search with retries. News is optional context, so exhaustion yields an
/// empty list.
pub async fn fetch_news(
    provider: &dyn NewsProvider,
    symbol: &str,
    name: &str,
    target_date: &str,
    backoff_base: Duration,
) -> Vec<NewsArticle> {
    let query = if name.is_empty() { symbol.to_string() } else { format!("{} {}", name, symbol) };
    let delays = ExponentialBackoff::from_millis(2)
        .factor((backoff_base.as_millis() as u64 / 2).max(1))
        .map(jitter)
        .take(NEWS_ATTEMPTS - 1);

    let query_ref = query.as_str();
    let result = Retry::spawn(delays, move || async move {
        provider.search(query_ref, NEWS_LIMIT * 4).await.map_err(|e| {
            tracing::debug!(symbol, provider = provider.name(), "news attempt failed: {}", e);
            e
        })
    })
    .await;

    match result {
        Ok(articles) => filter_news(articles, symbol, name, target_date),
        Err(e) => {
            tracing::warn!(symbol, "news unavailable after {} attempts: {}", NEWS_ATTEMPTS, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn article(title: &str, date: &str) -> NewsArticle {
        NewsArticle {
            title: title.into(),
            summary: format!("{}摘要", title),
            source: "wire".into(),
            published_at: format!("{}T08:00:00Z", date),
            url: String::new(),
        }
    }

    /// Serves a fixed list after failing `failures` times.
    pub(crate) struct StaticNews {
        pub articles: Vec<NewsArticle>,
        pub failures: usize,
        pub calls: AtomicUsize,
        pub queries: Mutex<Vec<String>>,
    }

    impl StaticNews {
        pub(crate) fn new(articles: Vec<NewsArticle>) -> Self {
            Self {
                articles,
                failures: 0,
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NewsProvider for StaticNews {
        async fn search(&self, query: &str, _limit: usize) -> PipelineResult<Vec<NewsArticle>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            if n < self.failures {
                return Err(PipelineError::ProviderTransient("503".into()));
            }
            Ok(self.articles.clone())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    #[test]
    fn filters_by_title_and_window() {
        let articles = vec![
            article("腾讯控股发布新游戏", "2026-01-10"),
            article("00700 回购公告", "2026-01-05"),
            article("腾讯控股旧闻", "2026-01-04"),
            article("腾讯控股明日新闻", "2026-01-11"),
            article("阿里巴巴业绩", "2026-01-09"),
        ];
        let kept = filter_news(articles, "00700", "腾讯控股", "2026-01-10");
        let titles: Vec<&str> = kept.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["腾讯控股发布新游戏", "00700 回购公告"]);
    }

    #[test]
    fn keeps_top_five() {
        let articles = (1..=8).map(|d| article("00700 动态", &format!("2026-01-0{}", d))).collect();
        let kept = filter_news(articles, "00700", "", "2026-01-08");
        assert_eq!(kept.len(), NEWS_LIMIT);
        assert!(kept[0].published_at.starts_with("2026-01-08"));
    }

    #[tokio::test]
    async fn retries_then_gives_up_quietly() {
        let mut flaky = StaticNews::new(vec![article("00700 回购", "2026-01-10")]);
        flaky.failures = 2;
        let news = fetch_news(&flaky, "00700", "腾讯控股", "2026-01-10", Duration::from_millis(1)).await;
        assert_eq!(news.len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let mut dead = StaticNews::new(Vec::new());
        dead.failures = 10;
        let news = fetch_news(&dead, "00700", "", "2026-01-10", Duration::from_millis(1)).await;
        assert!(news.is_empty());
        assert_eq!(dead.calls.load(Ordering::SeqCst), NEWS_ATTEMPTS);
        assert_eq!(dead.queries.lock().unwrap()[0], "00700");
    }
}
