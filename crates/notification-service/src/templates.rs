use crate::NotificationType;

/// A template resolved and filled for one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedTemplate {
    pub title: String,
    pub body: String,
    /// App-relative path, before tracking parameters.
    pub path: String,
}

struct Template {
    kind: NotificationType,
    tier: &'static str,
    lang: &'static str,
    title: &'static str,
    body: &'static str,
    path: &'static str,
}

const fn t(
    kind: NotificationType,
    tier: &'static str,
    lang: &'static str,
    title: &'static str,
    body: &'static str,
    path: &'static str,
) -> Template {
    Template {
        kind,
        tier,
        lang,
        title,
        body,
        path,
    }
}

use NotificationType::*;

const TEMPLATES: &[Template] = &[
    // -- Daily brief --------------------------------------------------------
    t(DailyBrief, "free", "zh", "今日自选股简报已送达", "{hook}", "/brief/{date}"),
    t(DailyBrief, "pro", "zh", "首席研报｜今日自选股深度解读", "{hook}", "/brief/{date}"),
    t(DailyBrief, "all", "en", "Your daily watchlist brief", "{hook}", "/brief/{date}"),
    // -- Signal flips -------------------------------------------------------
    t(
        SignalFlip,
        "all",
        "zh",
        "{name}({symbol}) 信号翻转 [{old}] → [{new}]",
        "AI 最新判断：{new_label}，置信度 {confidence}。点击查看完整推理。",
        "/stock/{symbol}",
    ),
    t(
        SignalFlip,
        "pro",
        "zh",
        "{name}({symbol}) 信号翻转 [{old}] → [{new}]",
        "首席模型信号由{old_label}转为{new_label}（置信度 {confidence}），完整战术计划已更新。",
        "/stock/{symbol}",
    ),
    t(
        SignalFlip,
        "all",
        "en",
        "{symbol} signal flipped [{old}] → [{new}]",
        "Latest AI call: {new} at {confidence} confidence.",
        "/stock/{symbol}",
    ),
    t(
        SignalFlipBatch,
        "all",
        "zh",
        "{count} 只自选股信号更新",
        "{symbols} 的 AI 信号发生变化，点击查看。",
        "/watchlist",
    ),
    t(
        SignalFlipBatch,
        "all",
        "en",
        "{count} watchlist signals updated",
        "Signals changed for {symbols}.",
        "/watchlist",
    ),
    // -- Morning call -------------------------------------------------------
    t(
        MorningCall,
        "free",
        "zh",
        "早盘提示：今日看多 {bullish_count} 只",
        "重点关注：{top}。",
        "/brief/{date}",
    ),
    t(
        MorningCall,
        "pro",
        "zh",
        "早盘策略：{bullish_count} 多 / {bearish_count} 空",
        "重点关注：{top}；风险提示：{risk}。",
        "/brief/{date}",
    ),
    t(
        MorningCallNeutral,
        "all",
        "zh",
        "早盘提示：自选股整体平稳",
        "{count} 只自选股今日无明确方向，建议观望。",
        "/brief/{date}",
    ),
    // -- Validation glory ---------------------------------------------------
    t(
        ValidationGlory,
        "all",
        "zh",
        "预测命中：{name}({symbol}) {change}",
        "上个交易日 AI 判断{signal_label}，实际涨跌 {change}，判断正确。",
        "/stock/{symbol}",
    ),
    t(
        ValidationGlory,
        "all",
        "en",
        "Called it: {symbol} {change}",
        "The AI called {signal} and the stock moved {change}.",
        "/stock/{symbol}",
    ),
    // -- Misc ---------------------------------------------------------------
    t(
        PredictionUpdated,
        "all",
        "zh",
        "{name}({symbol}) 预测已更新",
        "最新信号：{new_label}，置信度 {confidence}。",
        "/stock/{symbol}",
    ),
    t(
        PriceUpdate,
        "all",
        "zh",
        "行情已更新",
        "{date} 收盘数据已同步，共 {count} 只股票。",
        "/market",
    ),
];

pub struct NotificationTemplates;

impl NotificationTemplates {
    /// Resolve by language (`lang`, then `zh`) and within it by tier
    /// (`tier`, then `all`, then `free`).
    pub fn render(
        kind: NotificationType,
        tier: &str,
        lang: &str,
        vars: &[(&str, String)],
    ) -> Option<RenderedTemplate> {
        let template = Self::resolve(kind, tier, lang)?;
        Some(RenderedTemplate {
            title: fill(template.title, vars),
            body: fill(template.body, vars),
            path: fill(template.path, vars),
        })
    }

    fn resolve(kind: NotificationType, tier: &str, lang: &str) -> Option<&'static Template> {
        [lang, "zh"].into_iter().find_map(|l| {
            [tier, "all", "free"].into_iter().find_map(|tr| {
                TEMPLATES
                    .iter()
                    .find(|t| t.kind == kind && t.tier == tr && t.lang == l)
            })
        })
    }
}

/// Substitute `{name}` placeholders. Any unknown placeholder leaves the
/// template as written.
fn fill(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let Some((_, value)) = vars.iter().find(|(k, _)| *k == name) else {
            tracing::debug!(placeholder = name, "unfilled template placeholder");
            return template.to_string();
        };
        out.push_str(&rest[..start]);
        out.push_str(value);
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}
