//! Scriptable in-memory bus client for tests and development

use super::{measurement_topic, BusClient, BusError, BusMessage, BusResult};
use crate::core::AnchorId;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockInner {
    incoming: VecDeque<BusMessage>,
    published: Vec<BusMessage>,
    connected: bool,
    fail_polls: u32,
}

/// In-memory [`BusClient`] backed by a scripted message queue.
///
/// Clones share the same queue, so a test can keep one handle to feed
/// measurements and inspect publications while the coordinator owns another.
#[derive(Clone)]
pub struct MockBusClient {
    base_topic: String,
    inner: Arc<Mutex<MockInner>>,
}

impl MockBusClient {
    pub fn new(base_topic: impl Into<String>) -> Self {
        Self {
            base_topic: base_topic.into(),
            inner: Arc::new(Mutex::new(MockInner {
                incoming: VecDeque::new(),
                published: Vec::new(),
                connected: false,
                fail_polls: 0,
            })),
        }
    }

    /// Queue a raw message for delivery.
    pub fn push_message(&self, topic: impl Into<String>, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.incoming.push_back(BusMessage::new(topic, payload));
    }

    /// Queue a well-formed anchor vector report.
    pub fn push_vector(&self, anchor_id: AnchorId, t_unix_ns: i64, vector_cm: [f64; 3]) {
        let payload = format!(
            "{{\"t_unix_ns\":{},\"vector_local\":{{\"x\":{},\"y\":{},\"z\":{}}}}}",
            t_unix_ns, vector_cm[0], vector_cm[1], vector_cm[2]
        );
        self.push_message(
            measurement_topic(&self.base_topic, anchor_id),
            payload.into_bytes(),
        );
    }

    /// Make the next `count` polls fail with `ConnectionLost` and mark the
    /// client disconnected, as a dropped broker session would.
    pub fn script_connection_loss(&self, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_polls = count;
    }

    /// Everything published through this client so far.
    pub fn published(&self) -> Vec<BusMessage> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().incoming.len()
    }
}

impl BusClient for MockBusClient {
    fn connect(&mut self) -> BusResult<()> {
        self.inner.lock().unwrap().connected = true;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> BusResult<Option<BusMessage>> {
        let message = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected {
                return Err(BusError::NotConnected);
            }
            if inner.fail_polls > 0 {
                inner.fail_polls -= 1;
                inner.connected = false;
                return Err(BusError::ConnectionLost {
                    details: "scripted connection loss".to_string(),
                });
            }
            inner.incoming.pop_front()
        };

        if message.is_none() && !timeout.is_zero() {
            // Keep callers from spinning hot on an empty queue.
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        Ok(message)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> BusResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(BusError::NotConnected);
        }
        inner
            .published
            .push(BusMessage::new(topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn disconnect(&mut self) {
        self.inner.lock().unwrap().connected = false;
    }
}
