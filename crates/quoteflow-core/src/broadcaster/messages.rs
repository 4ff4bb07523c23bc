//! JSON messages exchanged with subscribed clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::connection::DisconnectReason;
use super::topic::TopicSpec;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Inbound control message.
///
/// ```json
/// {"type":"subscribe","topic":"prices","symbols":["BTC","ETH"]}
/// {"type":"unsubscribe","topic":"prices","symbols":["BTC","ETH"]}
/// {"type":"ping"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(TopicSpec),
    Unsubscribe(TopicSpec),
    Ping,
}

/// Outbound message. Every variant carries a Unix millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Data {
        topic: String,
        payload: Value,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Heartbeat {
        timestamp: i64,
    },
    RateLimitExceeded {
        retry_after_ms: u64,
        timestamp: i64,
    },
    SubscriptionConfirmed {
        topic: String,
        timestamp: i64,
    },
    Unsubscribed {
        topic: String,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn data(topic: impl Into<String>, payload: Value) -> Self {
        Self::Data {
            topic: topic.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: now_millis(),
        }
    }

    pub fn rate_limit_exceeded(retry_after_ms: u64) -> Self {
        Self::RateLimitExceeded {
            retry_after_ms,
            timestamp: now_millis(),
        }
    }

    pub fn subscription_confirmed(topic: impl Into<String>) -> Self {
        Self::SubscriptionConfirmed {
            topic: topic.into(),
            timestamp: now_millis(),
        }
    }

    pub fn unsubscribed(topic: impl Into<String>) -> Self {
        Self::Unsubscribed {
            topic: topic.into(),
            timestamp: now_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::Pong { .. } => "pong",
            Self::Heartbeat { .. } => "heartbeat",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::SubscriptionConfirmed { .. } => "subscription_confirmed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Item placed on a connection's outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Serialize and send to the client.
    Message(ServerMessage),
    /// The server ended the connection; the transport should close.
    Close(DisconnectReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"prices","symbols":["BTC"]}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe(TopicSpec::new("prices", ["BTC"]))
        );
    }

    #[test]
    fn test_parse_without_symbols_and_ping() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"unsubscribe","topic":"news"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unsubscribe(TopicSpec::new("news", Vec::<String>::new()))
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        let value = serde_json::to_value(ServerMessage::data("prices:BTC", json!({"btc": 100})))
            .unwrap();
        assert_eq!(value["type"], "data");
        assert_eq!(value["topic"], "prices:BTC");
        assert_eq!(value["payload"]["btc"], 100);
        assert!(value["timestamp"].as_i64().unwrap() > 0);

        let value = serde_json::to_value(ServerMessage::rate_limit_exceeded(1_500)).unwrap();
        assert_eq!(value["type"], "rate_limit_exceeded");
        assert_eq!(value["retry_after_ms"], 1_500);

        let value = serde_json::to_value(ServerMessage::subscription_confirmed("news")).unwrap();
        assert_eq!(value["type"], "subscription_confirmed");
        assert_eq!(ServerMessage::heartbeat().kind(), "heartbeat");
    }
}
