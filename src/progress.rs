//! Upload-side progress events
//!
//! Preprocessing emits a stream of typed events the transport layer frames
//! as SSE: progress updates, then exactly one terminal result or error.
//! Sends never fail — a disconnected client just stops receiving.

use serde::Serialize;
use tokio::sync::mpsc;

/// One event in the upload stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// Preprocessing step update.
    Progress {
        step: String,
        /// 0–100 over the whole upload.
        progress: u8,
        message: String,
    },
    /// Terminal success/failure with an optional payload.
    Result {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Terminal transport-level error.
    Error { error: String },
}

impl UploadEvent {
    pub fn progress(step: impl Into<String>, progress: u8, message: impl Into<String>) -> Self {
        Self::Progress {
            step: step.into(),
            progress,
            message: message.into(),
        }
    }

    pub fn result(data: serde_json::Value) -> Self {
        Self::Result {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Result {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Sending half of an upload stream. Cloneable; dropped receivers are fine.
#[derive(Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl ProgressSender {
    /// A connected channel pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that drops every event (CLI and tests that don't care).
    pub fn sink() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Receiver gone means nobody is watching; that is fine.
    pub fn send(&self, event: UploadEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tags() {
        let event = UploadEvent::progress("chunking", 40, "Splitting text");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["step"], "chunking");
        assert_eq!(json["progress"], 40);

        let done = UploadEvent::result(serde_json::json!({"book_id": "b1"}));
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn channel_delivers_and_sink_discards() {
        let (sender, mut rx) = ProgressSender::channel();
        sender.send(UploadEvent::progress("extracting", 10, "Reading"));
        assert!(matches!(
            rx.recv().await,
            Some(UploadEvent::Progress { .. })
        ));

        // Dropped receiver and sink sender both swallow sends.
        drop(rx);
        sender.send(UploadEvent::failure("late"));
        ProgressSender::sink().send(UploadEvent::failure("ignored"));
    }
}
