use pipeline_core::{DailyBrief, Signal, StockBrief, Tier};

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::{placeholders, Row, Value};

fn stock_brief_from_row(row: &Row) -> StoreResult<StockBrief> {
    Ok(StockBrief {
        symbol: row.text("symbol")?,
        date: row.text("date")?,
        tier: Tier::parse(&row.text("tier")?),
        stock_name: row.opt_text("stock_name").unwrap_or_default(),
        analysis_markdown: row.opt_text("analysis_markdown").unwrap_or_default(),
        raw_news: row.opt_text("raw_news"),
        signal: row.opt_text("signal").and_then(|s| Signal::parse(&s)),
        confidence: row.opt_real("confidence"),
        created_at: row.opt_text("created_at"),
    })
}

fn daily_brief_from_row(row: &Row) -> StoreResult<DailyBrief> {
    Ok(DailyBrief {
        user_id: row.text("user_id")?,
        date: row.text("date")?,
        content: row.text("content")?,
        push_hook: row.opt_text("push_hook").unwrap_or_default(),
        notified_at: row.opt_text("notified_at"),
    })
}

impl Store {
    /// Overwrites any existing brief for (symbol, date, tier).
    pub async fn upsert_stock_brief(&self, brief: &StockBrief) -> StoreResult<()> {
        let created_at = brief.created_at.clone().unwrap_or_else(|| self.now());
        self.execute(
            "INSERT INTO stock_briefs
                (symbol, date, tier, stock_name, analysis_markdown, raw_news, signal, confidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol, date, tier) DO UPDATE SET
                stock_name = excluded.stock_name,
                analysis_markdown = excluded.analysis_markdown,
                raw_news = excluded.raw_news,
                signal = excluded.signal,
                confidence = excluded.confidence,
                created_at = excluded.created_at",
            &params![
                &brief.symbol,
                &brief.date,
                brief.tier.as_str(),
                &brief.stock_name,
                &brief.analysis_markdown,
                brief.raw_news.as_deref(),
                brief.signal.map(|s| s.as_str()),
                brief.confidence,
                created_at,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_stock_brief(&self, symbol: &str, date: &str, tier: Tier) -> StoreResult<Option<StockBrief>> {
        match self
            .query_row(
                "SELECT * FROM stock_briefs WHERE symbol = ? AND date = ? AND tier = ?",
                &params![symbol, date, tier.as_str()],
            )
            .await?
        {
            Some(row) => Ok(Some(stock_brief_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Briefs for the given symbols on `date` at `tier`, in the order of `symbols`.
    pub async fn stock_briefs_for(
        &self,
        symbols: &[String],
        date: &str,
        tier: Tier,
    ) -> StoreResult<Vec<StockBrief>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM stock_briefs WHERE date = ? AND tier = ? AND symbol IN ({})",
            placeholders(symbols.len())
        );
        let mut params = params![date, tier.as_str()];
        params.extend(symbols.iter().map(Value::from));
        let mut briefs = self
            .query(&sql, &params)
            .await?
            .iter()
            .map(stock_brief_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        briefs.sort_by_key(|b| symbols.iter().position(|s| *s == b.symbol));
        Ok(briefs)
    }

    /// Writes content and push hook; `notified_at` is never touched here.
    pub async fn upsert_daily_brief(
        &self,
        user_id: &str,
        date: &str,
        content: &str,
        push_hook: &str,
    ) -> StoreResult<()> {
        self.execute(
            "INSERT INTO daily_briefs (user_id, date, content, push_hook, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, date) DO UPDATE SET
                content = excluded.content,
                push_hook = excluded.push_hook",
            &params![user_id, date, content, push_hook, self.now()],
        )
        .await?;
        Ok(())
    }

    pub async fn get_daily_brief(&self, user_id: &str, date: &str) -> StoreResult<Option<DailyBrief>> {
        match self
            .query_row(
                "SELECT * FROM daily_briefs WHERE user_id = ? AND date = ?",
                &params![user_id, date],
            )
            .await?
        {
            Some(row) => Ok(Some(daily_brief_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Set `notified_at` once. Returns false if it was already set.
    pub async fn mark_daily_brief_notified(&self, user_id: &str, date: &str) -> StoreResult<bool> {
        let result = self
            .execute(
                "UPDATE daily_briefs SET notified_at = ?
                 WHERE user_id = ? AND date = ? AND notified_at IS NULL",
                &params![self.now(), user_id, date],
            )
            .await?;
        Ok(result.rows_affected > 0)
    }
}
