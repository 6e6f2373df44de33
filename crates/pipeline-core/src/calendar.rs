use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, Offset, Utc, Weekday};

use crate::error::PipelineError;
use crate::types::Market;

/// Trading-day arithmetic per market.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, market: Market, date: NaiveDate) -> bool;

    /// First trading day strictly after `date`.
    fn next_trading_day(&self, market: Market, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        // Bounded so a misconfigured holiday list can't spin forever.
        for _ in 0..30 {
            if self.is_trading_day(market, d) {
                return d;
            }
            d += Duration::days(1);
        }
        d
    }

    /// String form used by the store: `YYYY-MM-DD` in, `YYYY-MM-DD` out.
    fn next_trading_date(&self, market: Market, date: &str) -> Result<String, PipelineError> {
        let parsed = parse_date(date)?;
        Ok(self
            .next_trading_day(market, parsed)
            .format("%Y-%m-%d")
            .to_string())
    }
}

pub fn parse_date(date: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| PipelineError::Parse(format!("invalid date '{}': {}", date, e)))
}

/// Monday-to-Friday calendar with optional per-market closures.
#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    holidays: HashMap<Market, HashSet<NaiveDate>>,
}

impl WeekdayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays(mut self, market: Market, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.entry(market).or_default().extend(dates);
        self
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, market: Market, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !self
            .holidays
            .get(&market)
            .map(|set| set.contains(&date))
            .unwrap_or(false)
    }
}

/// Wall clock pinned to the configured market offset.
#[derive(Debug, Clone, Copy)]
pub struct MarketClock {
    offset: FixedOffset,
}

impl MarketClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Parse offsets like `+08:00`, `-05:00` or `+0800`.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let s = raw.trim();
        let (sign, rest) = match s.chars().next() {
            Some('+') => (1, &s[1..]),
            Some('-') => (-1, &s[1..]),
            _ => return Err(PipelineError::Config(format!("invalid MARKET_TZ '{}'", raw))),
        };
        let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != 4 {
            return Err(PipelineError::Config(format!("invalid MARKET_TZ '{}'", raw)));
        }
        let hours: i32 = digits[..2]
            .parse()
            .map_err(|_| PipelineError::Config(format!("invalid MARKET_TZ '{}'", raw)))?;
        let minutes: i32 = digits[2..]
            .parse()
            .map_err(|_| PipelineError::Config(format!("invalid MARKET_TZ '{}'", raw)))?;
        let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| PipelineError::Config(format!("MARKET_TZ out of range '{}'", raw)))?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Timestamp string stored in `created_at`/`updated_at` columns.
    pub fn now_string(&self) -> String {
        Utc::now()
            .with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    pub fn today(&self) -> String {
        Utc::now()
            .with_timezone(&self.offset)
            .format("%Y-%m-%d")
            .to_string()
    }
}

impl Default for MarketClock {
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(8 * 3600).unwrap_or(Utc.fix()),
        }
    }
}
