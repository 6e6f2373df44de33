use std::collections::HashMap;

use serde::Deserialize;

use crate::NotificationType;

/// Parsed `users.notification_settings`.
///
/// ```json
/// {"enabled": true, "lang": "en", "types": {"signal_flip": false}}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationPreferences {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub types: HashMap<String, bool>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            lang: None,
            types: HashMap::new(),
        }
    }
}

impl NotificationPreferences {
    /// Missing or unreadable settings mean "everything on".
    pub fn from_settings(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Self::default(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                tracing::debug!("unreadable notification settings, using defaults: {}", e);
                Self::default()
            }),
        }
    }

    pub fn allows(&self, kind: NotificationType) -> bool {
        self.enabled
            && self
                .types
                .get(kind.preference_key())
                .copied()
                .unwrap_or(true)
    }
}
