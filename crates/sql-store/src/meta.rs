use std::collections::HashMap;

use pipeline_core::{Market, StockMeta};

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::{placeholders, Row, Value};

fn meta_from_row(row: &Row) -> StoreResult<StockMeta> {
    let symbol = row.text("symbol")?;
    let market = row
        .opt_text("market")
        .and_then(|m| Market::parse(&m))
        .unwrap_or_else(|| Market::infer(&symbol));
    Ok(StockMeta {
        name: row.opt_text("name").unwrap_or_default(),
        market,
        last_updated: row.opt_text("last_updated"),
        industry: row.opt_text("industry"),
        main_business: row.opt_text("main_business"),
        description: row.opt_text("description"),
        symbol,
    })
}

impl Store {
    pub async fn upsert_stock_meta(&self, meta: &StockMeta) -> StoreResult<()> {
        self.execute(
            "INSERT INTO stock_meta (symbol, name, market, last_updated, industry, main_business, description)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol) DO UPDATE SET
                name = excluded.name,
                market = excluded.market,
                last_updated = excluded.last_updated,
                industry = COALESCE(excluded.industry, stock_meta.industry),
                main_business = COALESCE(excluded.main_business, stock_meta.main_business),
                description = COALESCE(excluded.description, stock_meta.description)",
            &params![
                &meta.symbol,
                &meta.name,
                meta.market.as_str(),
                meta.last_updated.as_deref(),
                meta.industry.as_deref(),
                meta.main_business.as_deref(),
                meta.description.as_deref(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_stock_meta(&self, symbol: &str) -> StoreResult<Option<StockMeta>> {
        match self
            .query_row("SELECT * FROM stock_meta WHERE symbol = ?", &params![symbol])
            .await?
        {
            Some(row) => Ok(Some(meta_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn stock_metas(&self, symbols: &[String]) -> StoreResult<HashMap<String, StockMeta>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT * FROM stock_meta WHERE symbol IN ({})",
            placeholders(symbols.len())
        );
        let params: Vec<Value> = symbols.iter().map(Value::from).collect();
        let mut out = HashMap::new();
        for row in self.query(&sql, &params).await? {
            let meta = meta_from_row(&row)?;
            out.insert(meta.symbol.clone(), meta);
        }
        Ok(out)
    }

    /// Market from metadata, falling back to the symbol shape.
    pub async fn market_of(&self, symbol: &str) -> StoreResult<Market> {
        Ok(self
            .get_stock_meta(symbol)
            .await?
            .map(|m| m.market)
            .unwrap_or_else(|| Market::infer(symbol)))
    }
}
