use std::sync::Mutex;

use async_trait::async_trait;

use crate::{NotificationError, PushPayload, PushTransport};

/// In-process transport that remembers every payload, optionally failing.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<PushPayload>>,
    fail: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<PushPayload> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn push(&self, payload: &PushPayload) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::Push("503 Service Unavailable".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(payload.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
