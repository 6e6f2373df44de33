mod dispatcher;
mod manager;
mod preferences;
#[cfg(any(test, feature = "test-util"))]
mod recording;
mod templates;

pub use dispatcher::{tracking_id, tracked_url, Audience, DispatchOutcome, Dispatcher, Notification};
pub use manager::{FlushReport, MorningCall, NotificationManager};
pub use preferences::NotificationPreferences;
#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingTransport;
pub use templates::{NotificationTemplates, RenderedTemplate};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Every push the pipeline can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    DailyBrief,
    SignalFlip,
    SignalFlipBatch,
    MorningCall,
    MorningCallNeutral,
    ValidationGlory,
    PredictionUpdated,
    PriceUpdate,
}

impl NotificationType {
    pub const ALL: [NotificationType; 8] = [
        NotificationType::DailyBrief,
        NotificationType::SignalFlip,
        NotificationType::SignalFlipBatch,
        NotificationType::MorningCall,
        NotificationType::MorningCallNeutral,
        NotificationType::ValidationGlory,
        NotificationType::PredictionUpdated,
        NotificationType::PriceUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::DailyBrief => "daily_brief",
            NotificationType::SignalFlip => "signal_flip",
            NotificationType::SignalFlipBatch => "signal_flip_batch",
            NotificationType::MorningCall => "morning_call",
            NotificationType::MorningCallNeutral => "morning_call_neutral",
            NotificationType::ValidationGlory => "validation_glory",
            NotificationType::PredictionUpdated => "prediction_updated",
            NotificationType::PriceUpdate => "price_update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Preference switch governing this type; batch flips share the flip switch.
    pub fn preference_key(&self) -> &'static str {
        match self {
            NotificationType::SignalFlipBatch => NotificationType::SignalFlip.as_str(),
            NotificationType::MorningCallNeutral => NotificationType::MorningCall.as_str(),
            other => other.as_str(),
        }
    }
}

/// Body posted to the push service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
    /// Device-side dedup key.
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub broadcast: bool,
}

/// Delivery channel for rendered pushes.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn push(&self, payload: &PushPayload) -> Result<(), NotificationError>;
    fn name(&self) -> &str;
}

/// Errors from the notification system.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Push API error: {0}")]
    Push(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Internal push API: one POST per notification, bearer-authenticated.
pub struct HttpPushTransport {
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl HttpPushTransport {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, NotificationError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(NotificationError::Config("PUSH_API_URL is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url,
            secret,
            client,
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn push(&self, payload: &PushPayload) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Push(format!("{}: {}", status, body)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http-push"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_round_trip() {
        for t in NotificationType::ALL {
            assert_eq!(NotificationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(NotificationType::SignalFlipBatch.preference_key(), "signal_flip");
    }

    #[test]
    fn payload_carries_either_target_or_broadcast() {
        let mut payload = PushPayload {
            title: "t".into(),
            body: "b".into(),
            url: "/".into(),
            tag: "price_update-2026-01-02".into(),
            target_user_id: None,
            broadcast: true,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["broadcast"], true);
        assert!(json.get("target_user_id").is_none());

        payload.broadcast = false;
        payload.target_user_id = Some("u1".into());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["target_user_id"], "u1");
        assert!(json.get("broadcast").is_none());
    }

    #[test]
    fn empty_push_url_is_rejected() {
        assert!(matches!(HttpPushTransport::new(" ", None), Err(NotificationError::Config(_))));
    }
}
