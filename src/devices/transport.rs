//! Opaque command transports
//!
//! Devices hand fully formed payloads to a `Transport` and never see the
//! wire. Vendor protocol clients implement this trait; `LoggingTransport`
//! prints payloads for dry runs; test builds add a `RecordingTransport`
//! that captures them.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::TransportError;

/// Callback for unsolicited messages coming back from the device
pub type FeedbackCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn send(&self, payload: Value) -> Result<(), TransportError>;

    /// Register for device feedback
    ///
    /// Default implementation: no-op (transport has no feedback channel)
    fn subscribe_feedback(&self, _callback: FeedbackCallback) {}
}

/// Logs every payload instead of sending it
pub struct LoggingTransport {
    name: String,
    connected: AtomicBool,
    sent_count: AtomicU64,
}

impl LoggingTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            sent_count: AtomicU64::new(0),
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::Relaxed);
        info!("🔌 Transport '{}' connected (logging only)", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            info!(
                "🛑 Transport '{}' closed ({} payloads sent)",
                self.name,
                self.sent_count()
            );
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.name.clone()));
        }
        let n = self.sent_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "📤 [{}] '{}' → {} [#{}]",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            self.name,
            payload,
            n
        );
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingTransport;

#[cfg(test)]
mod recording {
    use super::*;
    use parking_lot::Mutex;
    use tracing::debug;

    /// Captures payloads and lets the caller inject feedback and failures
    pub struct RecordingTransport {
        name: String,
        connected: AtomicBool,
        sent: Mutex<Vec<Value>>,
        reject_containing: Mutex<Option<String>>,
        feedback: Mutex<Vec<FeedbackCallback>>,
    }

    impl RecordingTransport {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                connected: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                reject_containing: Mutex::new(None),
                feedback: Mutex::new(Vec::new()),
            }
        }

        pub fn sent(&self) -> Vec<Value> {
            self.sent.lock().clone()
        }

        pub fn clear(&self) {
            self.sent.lock().clear();
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::Relaxed);
        }

        /// Reject every payload whose JSON text contains `needle`
        pub fn reject_containing(&self, needle: impl Into<String>) {
            *self.reject_containing.lock() = Some(needle.into());
        }

        /// Deliver a feedback message to every subscriber
        pub fn push_feedback(&self, value: Value) {
            let callbacks = self.feedback.lock().clone();
            for callback in callbacks {
                callback(value.clone());
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self) -> Result<(), TransportError> {
            self.set_connected(true);
            Ok(())
        }

        async fn disconnect(&self) {
            self.set_connected(false);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        async fn send(&self, payload: Value) -> Result<(), TransportError> {
            if let Some(needle) = self.reject_containing.lock().as_deref() {
                if payload.to_string().contains(needle) {
                    return Err(TransportError::Rejected {
                        name: self.name.clone(),
                        reason: format!("payload contains '{}'", needle),
                    });
                }
            }
            debug!(transport = %self.name, %payload, "Recorded payload");
            self.sent.lock().push(payload);
            Ok(())
        }

        fn subscribe_feedback(&self, callback: FeedbackCallback) {
            self.feedback.lock().push(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test]
    async fn test_logging_transport_requires_connect() {
        let transport = LoggingTransport::new("log");
        assert!(matches!(
            transport.send(json!({"a": 1})).await,
            Err(TransportError::NotConnected(_))
        ));

        transport.connect().await.unwrap();
        transport.send(json!({"a": 1})).await.unwrap();
        transport.send(json!({"a": 2})).await.unwrap();
        assert_eq!(transport.sent_count(), 2);

        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_recording_transport() {
        let transport = RecordingTransport::new("rec");
        transport.reject_containing("boom");

        transport.send(json!({"cmd": "ok"})).await.unwrap();
        assert!(transport.send(json!({"cmd": "boom"})).await.is_err());
        assert_eq!(transport.sent(), vec![json!({"cmd": "ok"})]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.subscribe_feedback(Arc::new(move |v| sink.lock().push(v)));
        transport.push_feedback(json!({"level": 3}));
        assert_eq!(seen.lock().len(), 1);
    }
}
