//! Technical "signal dashboard" computed in code from the latest candles.
//!
//! The indicator step hands this to the model to interpret; the lite
//! translator derives signal and confidence from its confluence score.

use pipeline_core::{Candle, KeyLevels, Tactic, Tactics};
use serde::Serialize;

pub const CONFLUENCE_LIMIT: i32 = 5;

/// One scored row of the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimension {
    pub name: &'static str,
    pub reading: String,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalDashboard {
    pub dimensions: Vec<Dimension>,
    /// Bollinger %B of the latest close; informational, not scored.
    pub percent_b: Option<f64>,
    /// Sum of dimension scores clamped to [-5, 5].
    pub confluence: i32,
    pub populated: bool,
}

impl SignalDashboard {
    /// Score the latest candle of `daily` (oldest first) against its predecessor.
    pub fn compute(daily: &[Candle]) -> Self {
        let Some(cur) = daily.last() else {
            return Self::empty();
        };
        if !cur.indicators.is_populated() {
            return Self::empty();
        }
        let prev = daily.len().checked_sub(2).and_then(|i| daily.get(i));
        let ind = &cur.indicators;

        let mut dimensions = Vec::with_capacity(5);

        dimensions.push(if ind.ma5 > ind.ma10 && ind.ma10 > ind.ma20 {
            Dimension::new("均线排列", "MA5 > MA10 > MA20，多头排列", 1)
        } else if ind.ma5 < ind.ma10 && ind.ma10 < ind.ma20 {
            Dimension::new("均线排列", "MA5 < MA10 < MA20，空头排列", -1)
        } else {
            Dimension::new("均线排列", "均线交织，方向不明", 0)
        });

        dimensions.push(if cur.close > ind.ma5 && cur.close > ind.ma20 {
            Dimension::new("价格位置", "收盘价站上 MA5 与 MA20", 1)
        } else if cur.close < ind.ma5 && cur.close < ind.ma20 {
            Dimension::new("价格位置", "收盘价跌破 MA5 与 MA20", -1)
        } else {
            Dimension::new("价格位置", "收盘价位于 MA5 与 MA20 之间", 0)
        });

        dimensions.push(macd_dimension(cur, prev));
        dimensions.push(rsi_dimension(ind.rsi));
        dimensions.push(kdj_dimension(cur, prev));

        // A fresh MACD cross weighs ±2, so five agreeing dimensions reach ±6;
        // the reported score saturates at ±5.
        let sum: i32 = dimensions.iter().map(|d| d.score).sum();
        let band = ind.boll_upper - ind.boll_lower;
        let percent_b = (band > 0.0).then(|| (cur.close - ind.boll_lower) / band);

        Self {
            dimensions,
            percent_b,
            confluence: sum.clamp(-CONFLUENCE_LIMIT, CONFLUENCE_LIMIT),
            populated: true,
        }
    }

    fn empty() -> Self {
        Self {
            dimensions: Vec::new(),
            percent_b: None,
            confluence: 0,
            populated: false,
        }
    }

    /// Markdown scoring table embedded in the indicator prompt.
    pub fn render(&self) -> String {
        if !self.populated {
            return "指标数据不足，无法生成信号仪表盘。共振评分：0".to_string();
        }
        let mut out = String::from("| 维度 | 读数 | 评分 |\n|---|---|---|\n");
        for d in &self.dimensions {
            out.push_str(&format!("| {} | {} | {:+} |\n", d.name, d.reading, d.score));
        }
        if let Some(b) = self.percent_b {
            out.push_str(&format!("| 布林 %B | {:.2}（不计分） | - |\n", b));
        }
        out.push_str(&format!(
            "\n共振评分（范围 -5 ~ +5）：{:+}",
            self.confluence
        ));
        out
    }
}

impl Dimension {
    fn new(name: &'static str, reading: impl Into<String>, score: i32) -> Self {
        Self {
            name,
            reading: reading.into(),
            score,
        }
    }
}

fn macd_dimension(cur: &Candle, prev: Option<&Candle>) -> Dimension {
    let c = &cur.indicators;
    if let Some(p) = prev.map(|p| &p.indicators) {
        if p.macd <= p.macd_signal && c.macd > c.macd_signal {
            return Dimension::new("MACD", "DIF 上穿 DEA，金叉", 2);
        }
        if p.macd >= p.macd_signal && c.macd < c.macd_signal {
            return Dimension::new("MACD", "DIF 下穿 DEA，死叉", -2);
        }
    }
    let hist_delta = prev.map(|p| c.macd_hist - p.indicators.macd_hist);
    if c.macd > c.macd_signal {
        match hist_delta {
            Some(d) if d < 0.0 => Dimension::new("MACD", "多头区间，红柱缩短，动能减弱", 1),
            _ => Dimension::new("MACD", "多头区间，动能延续", 1),
        }
    } else if c.macd < c.macd_signal {
        match hist_delta {
            Some(d) if d > 0.0 => Dimension::new("MACD", "空头区间，绿柱收敛", -1),
            _ => Dimension::new("MACD", "空头区间，动能延续", -1),
        }
    } else {
        Dimension::new("MACD", "DIF 与 DEA 粘合", 0)
    }
}

fn rsi_dimension(rsi: f64) -> Dimension {
    if rsi >= 70.0 {
        Dimension::new("RSI", format!("{:.1}，超买区", rsi), -1)
    } else if rsi <= 30.0 {
        Dimension::new("RSI", format!("{:.1}，超卖区", rsi), 1)
    } else {
        Dimension::new("RSI", format!("{:.1}，中性区", rsi), 0)
    }
}

fn kdj_dimension(cur: &Candle, prev: Option<&Candle>) -> Dimension {
    let c = &cur.indicators;
    match prev.map(|p| &p.indicators) {
        Some(p) if p.kdj_k <= p.kdj_d && c.kdj_k > c.kdj_d => {
            Dimension::new("KDJ", "K 上穿 D，金叉", 1)
        }
        Some(p) if p.kdj_k >= p.kdj_d && c.kdj_k < c.kdj_d => {
            Dimension::new("KDJ", "K 下穿 D，死叉", -1)
        }
        _ => Dimension::new(
            "KDJ",
            format!("K {:.1} / D {:.1}，无交叉", c.kdj_k, c.kdj_d),
            0,
        ),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Support at the lower Bollinger band, resistance at the window high,
/// stop 3% under support.
pub fn key_levels(daily: &[Candle]) -> KeyLevels {
    let support = daily
        .last()
        .map(|c| c.indicators.boll_lower)
        .filter(|v| *v > 0.0)
        .unwrap_or(0.0);
    let resistance = daily.iter().map(|c| c.high).fold(0.0_f64, f64::max);
    KeyLevels {
        support: round2(support),
        resistance: round2(resistance),
        stop_loss: round2(support * 0.97),
    }
}

/// Playbook used when the model leaves tactics empty.
pub fn default_tactics(levels: &KeyLevels) -> Tactics {
    Tactics {
        holding: vec![Tactic::new(
            "P1",
            "跌破止损位减仓离场",
            &format!("收盘价跌破 {:.2}", levels.stop_loss),
            "控制回撤，保护本金",
        )],
        empty: vec![Tactic::new(
            "P1",
            "等待回踩支撑企稳再考虑",
            &format!("回踩 {:.2} 附近不破", levels.support),
            "不追高，等待更好的风险收益比",
        )],
        general: vec![Tactic::new(
            "P2",
            "关注压力位突破情况",
            &format!("放量站上 {:.2}", levels.resistance),
            "突破确认前保持谨慎",
        )],
    }
}
