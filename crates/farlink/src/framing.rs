//! JSON framing over text-only transports.
//!
//! [`JsonFraming`] turns a [`TextEndpoint`] into an [`Endpoint`]: outbound
//! values are serialized to one text frame each, inbound frames are parsed.
//! A frame that fails to parse cannot be matched to any pending request and
//! has no recovery path, so it is logged and dropped — never propagated.

use crate::endpoint::{ENDPOINT_BUFFER, Endpoint, TextEndpoint};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Structured-object view of a text transport.
pub struct JsonFraming {
    inner: Arc<dyn TextEndpoint>,
    parsed: broadcast::Sender<Value>,
    pump: JoinHandle<()>,
}

impl JsonFraming {
    /// Wrap a text endpoint. Spawns a pump task that parses inbound frames;
    /// the task ends when the underlying transport closes.
    pub fn new(inner: Arc<dyn TextEndpoint>) -> Self {
        let (parsed, _) = broadcast::channel(ENDPOINT_BUFFER);
        let mut frames = inner.subscribe_text();
        let relay = parsed.clone();
        let pump = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => match serde_json::from_str::<Value>(&frame) {
                        Ok(value) => {
                            let _ = relay.send(value);
                        }
                        Err(e) => {
                            log::warn!("dropping malformed inbound frame: {}", e);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("framing pump lagged, {} frames lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::debug!("framing pump stopped (transport closed)");
        });
        JsonFraming {
            inner,
            parsed,
            pump,
        }
    }
}

impl Endpoint for JsonFraming {
    fn post(&self, message: Value) {
        match serde_json::to_string(&message) {
            Ok(frame) => self.inner.post_text(frame),
            // serde_json can only fail here on non-string map keys, which the
            // protocol never produces.
            Err(e) => log::error!("failed to serialize outbound message: {}", e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.parsed.subscribe()
    }
}

impl Drop for JsonFraming {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::MemoryTextEndpoint;
    use serde_json::json;
    use std::time::Duration;

    async fn recv(rx: &mut broadcast::Receiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel open")
    }

    #[tokio::test]
    async fn values_round_trip_through_text_frames() {
        let (a, b) = MemoryTextEndpoint::pair();
        let a = JsonFraming::new(Arc::new(a));
        let b = JsonFraming::new(Arc::new(b));

        let mut rx = b.subscribe();
        a.post(json!({ "n": 1, "nested": { "ok": true } }));

        let got = recv(&mut rx).await;
        assert_eq!(got, json!({ "n": 1, "nested": { "ok": true } }));
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_not_propagated() {
        let (a, b) = MemoryTextEndpoint::pair();
        let framed = JsonFraming::new(Arc::new(b));
        let mut rx = framed.subscribe();

        a.post_text("{ not json".to_string());
        a.post_text("42".to_string());

        // The bad frame vanishes; the next good one still arrives.
        let got = recv(&mut rx).await;
        assert_eq!(got, json!(42));
    }

    #[tokio::test]
    async fn subscription_sees_only_subsequent_frames() {
        let (a, b) = MemoryTextEndpoint::pair();
        let framed = JsonFraming::new(Arc::new(b));

        a.post_text("1".to_string());
        tokio::task::yield_now().await;

        let mut rx = framed.subscribe();
        a.post_text("2".to_string());
        let got = recv(&mut rx).await;
        assert_eq!(got, json!(2));
    }
}
