use std::sync::Arc;

use notification_service::{DispatchOutcome, Dispatcher};
use pipeline_core::{PipelineError, PipelineResult, Signal, StockBrief, Tier, User};
use sql_store::Store;

/// A per-user brief ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledBrief {
    /// Tier of the stock briefs actually used, after any pro fallback.
    pub tier: Tier,
    pub symbols: Vec<String>,
    pub content: String,
    pub push_hook: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Phase2Report {
    pub date: String,
    pub assembled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notified: usize,
}

/// Phase 2: per-user assembly from cached stock briefs, no LLM calls.
pub struct BriefAssembler {
    store: Store,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl BriefAssembler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Stock briefs for the user's watchlist at their effective tier. A pro
    /// user with no pro briefs falls back to free once.
    async fn briefs_for(&self, user: &User, watchlist: &[String], date: &str) -> PipelineResult<(Tier, Vec<StockBrief>)> {
        let tier = user.effective_tier(&self.store.clock().today());
        let briefs = self.store.stock_briefs_for(watchlist, date, tier).await?;
        if briefs.is_empty() && tier == Tier::Pro {
            tracing::debug!(user_id = %user.user_id, "no pro briefs, falling back to free");
            return Ok((Tier::Free, self.store.stock_briefs_for(watchlist, date, Tier::Free).await?));
        }
        Ok((tier, briefs))
    }

    /// Build and upsert the user's daily brief. `notified_at` is left alone.
    pub async fn assemble_user_brief(
        &self,
        user: &User,
        watchlist: &[String],
        date: &str,
    ) -> PipelineResult<AssembledBrief> {
        let (tier, briefs) = self.briefs_for(user, watchlist, date).await?;
        if briefs.is_empty() {
            return Err(PipelineError::DataMissing(format!(
                "no stock briefs for {} on {}",
                user.user_id, date
            )));
        }

        let assembled = AssembledBrief {
            tier,
            symbols: briefs.iter().map(|b| b.symbol.clone()).collect(),
            content: render_content(date, tier, &briefs),
            push_hook: push_hook(tier, &briefs),
        };
        self.store
            .upsert_daily_brief(&user.user_id, date, &assembled.content, &assembled.push_hook)
            .await?;
        Ok(assembled)
    }

    /// Every user with a watchlist. One user's failure never stops the batch.
    pub async fn run(&self, date: &str) -> PipelineResult<Phase2Report> {
        let mut report = Phase2Report {
            date: date.to_string(),
            ..Default::default()
        };

        for (user, watchlist) in self.store.users_with_watchlists().await? {
            match self.assemble_user_brief(&user, &watchlist, date).await {
                Ok(brief) => {
                    report.assembled += 1;
                    tracing::debug!(user_id = %user.user_id, tier = brief.tier.as_str(), stocks = brief.symbols.len(), "daily brief assembled");
                }
                Err(PipelineError::DataMissing(reason)) => {
                    report.skipped += 1;
                    tracing::info!(user_id = %user.user_id, "brief skipped: {}", reason);
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(user_id = %user.user_id, "brief assembly failed: {}", e);
                    continue;
                }
            }

            let Some(dispatcher) = &self.dispatcher else {
                continue;
            };
            match dispatcher.send_daily_brief(&user, date).await {
                Ok(outcome) if outcome.delivered() => report.notified += 1,
                Ok(DispatchOutcome::Skipped(reason)) => {
                    tracing::debug!(user_id = %user.user_id, "brief push skipped: {}", reason)
                }
                Ok(_) => {}
                Err(e) => tracing::error!(user_id = %user.user_id, "brief push failed: {}", e),
            }
        }

        tracing::info!(
            date,
            assembled = report.assembled,
            skipped = report.skipped,
            failed = report.failed,
            notified = report.notified,
            "phase 2 complete"
        );
        Ok(report)
    }
}

/// Header, one section per stock, and a footer stamped with the newest
/// brief's creation time so reassembly is byte-stable.
pub fn render_content(date: &str, tier: Tier, briefs: &[StockBrief]) -> String {
    let title = match tier {
        Tier::Free => "自选股简报",
        Tier::Pro => "自选股深度简报",
    };
    let mut out = format!("# {} {}\n", date, title);
    for brief in briefs {
        out.push_str(&format!("\n## {}（{}）\n\n", brief.stock_name, brief.symbol));
        out.push_str(brief.analysis_markdown.trim());
        out.push('\n');
    }
    let generated = briefs
        .iter()
        .filter_map(|b| b.created_at.as_deref())
        .max()
        .unwrap_or(date);
    out.push_str(&format!("\n---\n*生成时间：{}*\n", generated));
    out
}

fn names(briefs: &[&StockBrief]) -> String {
    briefs
        .iter()
        .map(|b| if b.stock_name.is_empty() { b.symbol.as_str() } else { b.stock_name.as_str() })
        .collect::<Vec<_>>()
        .join("、")
}

/// Bullish names the top one or two by confidence, else bearish gives a
/// risk line, else a neutral count.
pub fn push_hook(tier: Tier, briefs: &[StockBrief]) -> String {
    let by_signal = |signal: Signal| {
        let mut picked: Vec<&StockBrief> = briefs.iter().filter(|b| b.signal == Some(signal)).collect();
        picked.sort_by(|a, b| {
            b.confidence
                .unwrap_or(0.0)
                .total_cmp(&a.confidence.unwrap_or(0.0))
        });
        picked
    };

    let bullish = by_signal(Signal::Long);
    if !bullish.is_empty() {
        let top = names(&bullish[..bullish.len().min(2)]);
        return match tier {
            Tier::Free => format!("{} 今日信号偏多，点开看看", top),
            Tier::Pro => format!("多头信号：{}，附首席深度解读与操作思路", top),
        };
    }

    let bearish = by_signal(Signal::Short);
    if !bearish.is_empty() {
        let top = names(&bearish[..1]);
        return match (tier, bearish.len()) {
            (Tier::Free, 1) => format!("{} 出现风险信号，注意防守", top),
            (Tier::Free, n) => format!("{} 等 {} 只自选股出现风险信号，注意防守", top, n),
            (Tier::Pro, n) => format!("风险提示：{} 只自选股转空（{} 领跌），查看应对策略", n, top),
        };
    }

    match tier {
        Tier::Free => format!("{} 只自选股走势平稳", briefs.len()),
        Tier::Pro => format!("{} 只自选股走势平稳，首席解读已更新", briefs.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::user;
    use notification_service::RecordingTransport;

    fn brief(symbol: &str, name: &str, tier: Tier, signal: Signal, confidence: f64) -> StockBrief {
        StockBrief {
            symbol: symbol.into(),
            date: "2026-01-09".into(),
            tier,
            stock_name: name.into(),
            analysis_markdown: format!("{} {} 解读", name, tier.as_str()),
            raw_news: None,
            signal: Some(signal),
            confidence: Some(confidence),
            created_at: Some("2026-01-09 18:30:00".into()),
        }
    }

    async fn watcher(store: &Store, id: &str, tier: &str, symbols: &[&str]) -> User {
        let u = user(id, tier);
        store.upsert_user(&u).await.unwrap();
        for s in symbols {
            store.add_to_watchlist(id, s).await.unwrap();
        }
        u
    }

    #[tokio::test]
    async fn tiers_get_their_own_briefs() {
        let store = Store::in_memory().await.unwrap();
        for tier in Tier::ALL {
            store
                .upsert_stock_brief(&brief("00700", "腾讯控股", tier, Signal::Long, 0.8))
                .await
                .unwrap();
        }
        watcher(&store, "u_free", "free", &["00700"]).await;
        watcher(&store, "u_pro", "pro", &["00700"]).await;

        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), transport.clone(), "https://app.example.com"));
        let assembler = BriefAssembler::new(store.clone()).with_dispatcher(dispatcher);
        let report = assembler.run("2026-01-09").await.unwrap();
        assert_eq!((report.assembled, report.skipped, report.failed, report.notified), (2, 0, 0, 2));

        let free = store.get_daily_brief("u_free", "2026-01-09").await.unwrap().unwrap();
        let pro = store.get_daily_brief("u_pro", "2026-01-09").await.unwrap().unwrap();
        assert!(free.content.contains("腾讯控股 free 解读"));
        assert!(pro.content.contains("腾讯控股 pro 解读"));
        assert!(!free.content.contains("pro 解读"));
        assert_ne!(free.push_hook, pro.push_hook);
        assert!(free.notified_at.is_some());
        assert!(pro.notified_at.is_some());

        let titles: Vec<String> = transport.sent().into_iter().map(|p| p.title).collect();
        assert!(titles.contains(&"今日自选股简报已送达".to_string()));
        assert!(titles.contains(&"首席研报｜今日自选股深度解读".to_string()));

        // second run reassembles but does not push again
        let again = assembler.run("2026-01-09").await.unwrap();
        assert_eq!((again.assembled, again.notified), (2, 0));
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn pro_falls_back_to_free_briefs() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_stock_brief(&brief("00700", "腾讯控股", Tier::Free, Signal::Side, 0.5))
            .await
            .unwrap();
        let pro = watcher(&store, "u_pro", "pro", &["00700"]).await;

        let assembler = BriefAssembler::new(store.clone());
        let assembled = assembler
            .assemble_user_brief(&pro, &["00700".to_string()], "2026-01-09")
            .await
            .unwrap();
        assert_eq!(assembled.tier, Tier::Free);
        assert!(assembled.content.contains("腾讯控股 free 解读"));
        assert_eq!(assembled.push_hook, "1 只自选股走势平稳");
    }

    #[tokio::test]
    async fn users_without_briefs_are_skipped() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_stock_brief(&brief("00700", "腾讯控股", Tier::Free, Signal::Long, 0.8))
            .await
            .unwrap();
        watcher(&store, "u1", "free", &["00700"]).await;
        watcher(&store, "u2", "free", &["09988"]).await;

        let report = BriefAssembler::new(store.clone()).run("2026-01-09").await.unwrap();
        assert_eq!((report.assembled, report.skipped), (1, 1));
        assert!(store.get_daily_brief("u2", "2026-01-09").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reassembly_is_stable() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_stock_brief(&brief("00700", "腾讯控股", Tier::Free, Signal::Short, 0.7))
            .await
            .unwrap();
        store
            .upsert_stock_brief(&brief("09988", "阿里巴巴", Tier::Free, Signal::Side, 0.5))
            .await
            .unwrap();
        let u = watcher(&store, "u1", "free", &["00700", "09988"]).await;
        let watchlist = vec!["00700".to_string(), "09988".to_string()];

        let assembler = BriefAssembler::new(store.clone());
        let first = assembler.assemble_user_brief(&u, &watchlist, "2026-01-09").await.unwrap();
        let second = assembler.assemble_user_brief(&u, &watchlist, "2026-01-09").await.unwrap();
        assert_eq!(first, second);
        assert!(first.content.starts_with("# 2026-01-09 自选股简报\n"));
        assert!(first.content.ends_with("*生成时间：2026-01-09 18:30:00*\n"));
        assert_eq!(first.push_hook, "腾讯控股 出现风险信号，注意防守");
    }

    #[test]
    fn hook_names_top_two_bulls() {
        let briefs = vec![
            brief("A", "甲", Tier::Free, Signal::Long, 0.6),
            brief("B", "乙", Tier::Free, Signal::Long, 0.9),
            brief("C", "丙", Tier::Free, Signal::Short, 0.95),
            brief("D", "丁", Tier::Free, Signal::Long, 0.7),
        ];
        assert_eq!(push_hook(Tier::Free, &briefs), "乙、丁 今日信号偏多，点开看看");
        assert_eq!(push_hook(Tier::Pro, &briefs), "多头信号：乙、丁，附首席深度解读与操作思路");

        let bears = vec![
            brief("C", "丙", Tier::Pro, Signal::Short, 0.6),
            brief("E", "戊", Tier::Pro, Signal::Short, 0.8),
        ];
        assert_eq!(push_hook(Tier::Pro, &bears), "风险提示：2 只自选股转空（戊 领跌），查看应对策略");
        assert_eq!(push_hook(Tier::Free, &bears), "戊 等 2 只自选股出现风险信号，注意防守");
    }
}
