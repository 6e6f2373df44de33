use std::sync::Arc;

use pipeline_core::{PipelineResult, User};
use sql_store::{NotificationLogEntry, Store};
use uuid::Uuid;

use crate::preferences::NotificationPreferences;
use crate::templates::NotificationTemplates;
use crate::{NotificationType, PushPayload, PushTransport};

/// Who a notification is for.
#[derive(Debug, Clone)]
pub enum Audience {
    User(User),
    Broadcast,
}

/// A notification before template resolution.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationType,
    pub date: String,
    pub related_symbols: Vec<String>,
    pub vars: Vec<(&'static str, String)>,
}

impl Notification {
    pub fn new(kind: NotificationType, date: impl Into<String>) -> Self {
        let date = date.into();
        Self {
            kind,
            vars: vec![("date", date.clone())],
            date,
            related_symbols: Vec::new(),
        }
    }

    pub fn var(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.vars.push((name, value.into()));
        self
    }

    pub fn symbols(mut self, symbols: impl IntoIterator<Item = String>) -> Self {
        self.related_symbols.extend(symbols);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent(String),
    /// Logged but not pushed.
    DryRun(String),
    /// Blocked by the recipient's preferences.
    Suppressed,
    Skipped(String),
    Failed(String),
}

impl DispatchOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Sent(_) | DispatchOutcome::DryRun(_))
    }
}

/// `notif_` plus twelve hex characters.
pub fn tracking_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("notif_{}", &uuid[..12])
}

pub fn tracked_url(base: &str, path: &str, nid: &str, kind: NotificationType) -> String {
    let mut url = format!("{}{}", base.trim_end_matches('/'), path);
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&format!(
        "nid={}&utm_source=push&utm_medium={}",
        nid,
        kind.as_str()
    ));
    url
}

/// Preference gate, rendering, push and analytics logging for single
/// notifications. Failures are logged and reported, never retried.
pub struct Dispatcher {
    store: Store,
    transport: Arc<dyn PushTransport>,
    app_base_url: String,
    default_lang: String,
    dry_run: bool,
}

impl Dispatcher {
    pub fn new(store: Store, transport: Arc<dyn PushTransport>, app_base_url: impl Into<String>) -> Self {
        Self {
            store,
            transport,
            app_base_url: app_base_url.into(),
            default_lang: "zh".to_string(),
            dry_run: false,
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.default_lang = lang.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn dispatch(&self, audience: &Audience, notification: &Notification) -> DispatchOutcome {
        let kind = notification.kind;
        let (tier, lang, user_id) = match audience {
            Audience::User(user) => {
                let prefs = NotificationPreferences::from_settings(user.notification_settings.as_deref());
                if !prefs.allows(kind) {
                    tracing::debug!(user_id = %user.user_id, kind = kind.as_str(), "suppressed by preferences");
                    return DispatchOutcome::Suppressed;
                }
                let tier = user.effective_tier(&self.store.clock().today());
                let lang = prefs.lang.unwrap_or_else(|| self.default_lang.clone());
                (tier.as_str(), lang, Some(user.user_id.clone()))
            }
            Audience::Broadcast => ("all", self.default_lang.clone(), None),
        };

        let Some(rendered) = NotificationTemplates::render(kind, tier, &lang, &notification.vars) else {
            tracing::warn!(kind = kind.as_str(), tier, lang = %lang, "no template");
            return DispatchOutcome::Skipped("no template".into());
        };

        let id = tracking_id();
        let url = tracked_url(&self.app_base_url, &rendered.path, &id, kind);
        let tag = match &user_id {
            Some(user_id) => format!("{}-{}-{}", kind.as_str(), user_id, notification.date),
            None => format!("{}-{}", kind.as_str(), notification.date),
        };
        let payload = PushPayload {
            title: rendered.title,
            body: rendered.body,
            url,
            tag,
            broadcast: user_id.is_none(),
            target_user_id: user_id.clone(),
        };

        if !self.dry_run {
            if let Err(e) = self.transport.push(&payload).await {
                tracing::warn!(
                    user_id = user_id.as_deref().unwrap_or("*"),
                    kind = kind.as_str(),
                    transport = self.transport.name(),
                    "push failed: {}",
                    e
                );
                return DispatchOutcome::Failed(e.to_string());
            }
        }

        let entry = NotificationLogEntry {
            id: id.clone(),
            user_id,
            notification_type: kind.as_str().to_string(),
            related_symbols: notification.related_symbols.clone(),
            title: payload.title,
            body: payload.body,
            url: Some(payload.url),
            sent_at: self.store.now(),
            clicked_at: None,
            channel: if self.dry_run { "dry_run" } else { "push" }.to_string(),
        };
        if let Err(e) = self.store.insert_notification_log(&entry).await {
            tracing::warn!(id = %id, "failed to write notification log: {}", e);
        }

        if self.dry_run {
            DispatchOutcome::DryRun(id)
        } else {
            DispatchOutcome::Sent(id)
        }
    }

    /// Push a user's assembled daily brief once. `notified_at` is set only
    /// after a real push succeeds, so a crash in between can repeat it.
    pub async fn send_daily_brief(&self, user: &User, date: &str) -> PipelineResult<DispatchOutcome> {
        let Some(brief) = self.store.get_daily_brief(&user.user_id, date).await? else {
            return Ok(DispatchOutcome::Skipped("no daily brief".into()));
        };
        if brief.notified_at.is_some() {
            return Ok(DispatchOutcome::Skipped("already notified".into()));
        }

        let notification = Notification::new(NotificationType::DailyBrief, date).var("hook", brief.push_hook);
        let outcome = self.dispatch(&Audience::User(user.clone()), &notification).await;
        if let DispatchOutcome::Sent(_) = outcome {
            self.store.mark_daily_brief_notified(&user.user_id, date).await?;
        }
        Ok(outcome)
    }

    /// Market-wide "prices synced" push.
    pub async fn broadcast_price_update(&self, date: &str, symbols: usize) -> DispatchOutcome {
        let notification = Notification::new(NotificationType::PriceUpdate, date).var("count", symbols.to_string());
        self.dispatch(&Audience::Broadcast, &notification).await
    }
}
