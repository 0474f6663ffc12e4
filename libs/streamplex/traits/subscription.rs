use crate::traits::Message;
use serde_json::{json, Value};

/// Trait for producing subscription messages for a topic
///
/// Called every time a connection for the topic reaches `Open`, including
/// after reconnects. `request_id` is unique per engine instance.
pub trait SubscriptionFormatter: Send + Sync {
    /// Message to send when the connection opens (`None` = send nothing)
    fn subscribe(&self, topic: &str, request_id: u64) -> Option<Message>;

    /// Message to send before an explicit unsubscribe closes the connection
    fn unsubscribe(&self, topic: &str, request_id: u64) -> Option<Message>;

    /// If `message` acknowledges a request, return that request's id
    ///
    /// Acknowledgements are consumed by the engine and not delivered to the
    /// handler.
    fn acknowledged_id(&self, _message: &Message) -> Option<u64> {
        None
    }
}

/// JSON `method`/`params`/`id` subscription format
///
/// Produces `{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":1}` for
/// topic `btcusdt` with suffix `@trade`, and recognises the
/// `{"result":null,"id":1}` acknowledgement.
#[derive(Debug, Clone)]
pub struct JsonMethodSubscription {
    stream_suffix: String,
}

impl JsonMethodSubscription {
    /// # Arguments
    /// * `stream_suffix` - Appended to each topic to form the stream name (e.g. `@trade`)
    pub fn new(stream_suffix: impl Into<String>) -> Self {
        Self {
            stream_suffix: stream_suffix.into(),
        }
    }

    fn stream_name(&self, topic: &str) -> String {
        format!("{}{}", topic, self.stream_suffix)
    }

    fn request(&self, method: &str, topic: &str, request_id: u64) -> Message {
        let body = json!({
            "method": method,
            "params": [self.stream_name(topic)],
            "id": request_id,
        });
        Message::text(body.to_string())
    }
}

impl Default for JsonMethodSubscription {
    fn default() -> Self {
        Self::new("@trade")
    }
}

impl SubscriptionFormatter for JsonMethodSubscription {
    fn subscribe(&self, topic: &str, request_id: u64) -> Option<Message> {
        Some(self.request("SUBSCRIBE", topic, request_id))
    }

    fn unsubscribe(&self, topic: &str, request_id: u64) -> Option<Message> {
        Some(self.request("UNSUBSCRIBE", topic, request_id))
    }

    fn acknowledged_id(&self, message: &Message) -> Option<u64> {
        let text = message.as_text()?;
        // Cheap pre-filter; market data never carries a top-level "result"
        if !text.contains("\"result\"") {
            return None;
        }
        let value: Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;
        if !object.get("result").map(Value::is_null).unwrap_or(false) {
            return None;
        }
        object.get("id").and_then(Value::as_u64)
    }
}

/// Sends nothing; the topic is already part of the endpoint path
pub struct NoSubscription;

impl SubscriptionFormatter for NoSubscription {
    fn subscribe(&self, _topic: &str, _request_id: u64) -> Option<Message> {
        None
    }

    fn unsubscribe(&self, _topic: &str, _request_id: u64) -> Option<Message> {
        None
    }
}
