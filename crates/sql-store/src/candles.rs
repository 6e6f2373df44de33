use std::collections::HashMap;

use pipeline_core::{Candle, Indicators, MarketMood, Period};

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::{placeholders, Row, Value};

const CANDLE_COLUMNS: [&str; 22] = [
    "symbol",
    "date",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "change_percent",
    "ma5",
    "ma10",
    "ma20",
    "ma60",
    "macd",
    "macd_signal",
    "macd_hist",
    "boll_upper",
    "boll_mid",
    "boll_lower",
    "rsi",
    "kdj_k",
    "kdj_d",
    "kdj_j",
];

fn candle_from_row(row: &Row) -> StoreResult<Candle> {
    let ind = |c: &str| row.opt_real(c).unwrap_or(0.0);
    Ok(Candle {
        symbol: row.text("symbol")?,
        date: row.text("date")?,
        open: row.real("open")?,
        high: row.real("high")?,
        low: row.real("low")?,
        close: row.real("close")?,
        volume: row.opt_real("volume").unwrap_or(0.0),
        change_percent: row.opt_real("change_percent").unwrap_or(0.0),
        indicators: Indicators {
            ma5: ind("ma5"),
            ma10: ind("ma10"),
            ma20: ind("ma20"),
            ma60: ind("ma60"),
            macd: ind("macd"),
            macd_signal: ind("macd_signal"),
            macd_hist: ind("macd_hist"),
            boll_upper: ind("boll_upper"),
            boll_mid: ind("boll_mid"),
            boll_lower: ind("boll_lower"),
            rsi: ind("rsi"),
            kdj_k: ind("kdj_k"),
            kdj_d: ind("kdj_d"),
            kdj_j: ind("kdj_j"),
        },
    })
}

fn candle_values(c: &Candle) -> Vec<Value> {
    let i = &c.indicators;
    params![
        &c.symbol,
        &c.date,
        c.open,
        c.high,
        c.low,
        c.close,
        c.volume,
        c.change_percent,
        i.ma5,
        i.ma10,
        i.ma20,
        i.ma60,
        i.macd,
        i.macd_signal,
        i.macd_hist,
        i.boll_upper,
        i.boll_mid,
        i.boll_lower,
        i.rsi,
        i.kdj_k,
        i.kdj_d,
        i.kdj_j,
    ]
}

impl Store {
    /// Bulk upsert candles for one period (≤ 500 rows per statement).
    pub async fn upsert_candles(&self, period: Period, candles: &[Candle]) -> StoreResult<u64> {
        if candles.is_empty() {
            return Ok(0);
        }
        let updates = CANDLE_COLUMNS[2..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict = format!("ON CONFLICT(symbol, date) DO UPDATE SET {}", updates);
        let rows: Vec<Vec<Value>> = candles.iter().map(candle_values).collect();
        self.insert_batch(period.table(), &CANDLE_COLUMNS, &rows, &conflict)
            .await
    }

    pub async fn latest_candle_date(&self, period: Period, symbol: &str) -> StoreResult<Option<String>> {
        let sql = format!(
            "SELECT MAX(date) AS date FROM {} WHERE symbol = ?",
            period.table()
        );
        Ok(self
            .query_row(&sql, &params![symbol])
            .await?
            .and_then(|r| r.opt_text("date")))
    }

    pub async fn candle_on(&self, period: Period, symbol: &str, date: &str) -> StoreResult<Option<Candle>> {
        let sql = format!(
            "SELECT * FROM {} WHERE symbol = ? AND date = ?",
            period.table()
        );
        match self.query_row(&sql, &params![symbol, date]).await? {
            Some(row) => Ok(Some(candle_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` most recent candles dated `<= as_of`, oldest first.
    pub async fn recent_candles(
        &self,
        period: Period,
        symbol: &str,
        as_of: &str,
        limit: usize,
    ) -> StoreResult<Vec<Candle>> {
        let sql = format!(
            "SELECT * FROM {} WHERE symbol = ? AND date <= ? ORDER BY date DESC LIMIT ?",
            period.table()
        );
        let rows = self.query(&sql, &params![symbol, as_of, limit]).await?;
        let mut candles = rows
            .iter()
            .map(candle_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    /// Latest daily `(close, change_percent)` at or before `date` for each symbol.
    pub async fn latest_closes(
        &self,
        symbols: &[String],
        date: &str,
    ) -> StoreResult<HashMap<String, (f64, f64)>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT d.symbol, d.close, d.change_percent
             FROM daily_prices d
             JOIN (
                SELECT symbol, MAX(date) AS max_date FROM daily_prices
                WHERE date <= ? AND symbol IN ({})
                GROUP BY symbol
             ) m ON d.symbol = m.symbol AND d.date = m.max_date",
            placeholders(symbols.len())
        );
        let mut params = params![date];
        params.extend(symbols.iter().map(Value::from));

        let mut out = HashMap::new();
        for row in self.query(&sql, &params).await? {
            out.insert(
                row.text("symbol")?,
                (row.real("close")?, row.opt_real("change_percent").unwrap_or(0.0)),
            );
        }
        Ok(out)
    }

    /// Number of symbols with a daily candle on `date`.
    pub async fn priced_symbol_count(&self, date: &str) -> StoreResult<i64> {
        let row = self
            .query_row("SELECT COUNT(*) AS n FROM daily_prices WHERE date = ?", &params![date])
            .await?;
        Ok(row.and_then(|r| r.opt_integer("n")).unwrap_or(0))
    }

    /// Advance/decline breadth over every daily candle on `date`.
    pub async fn market_breadth(&self, date: &str) -> StoreResult<Option<MarketMood>> {
        let row = self
            .query_row(
                "SELECT COUNT(*) AS n,
                        SUM(CASE WHEN change_percent > 0 THEN 1 ELSE 0 END) AS up,
                        SUM(CASE WHEN change_percent < 0 THEN 1 ELSE 0 END) AS down,
                        AVG(change_percent) AS avg_change
                 FROM daily_prices WHERE date = ?",
                &params![date],
            )
            .await?;
        Ok(row.and_then(|r| {
            if r.opt_integer("n").unwrap_or(0) == 0 {
                return None;
            }
            Some(MarketMood {
                advancing: r.opt_integer("up").unwrap_or(0),
                declining: r.opt_integer("down").unwrap_or(0),
                avg_change: r.opt_real("avg_change").unwrap_or(0.0),
            })
        }))
    }
}
