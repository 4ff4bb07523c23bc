//! Topic specifications and their canonical keys.
//!
//! A key is the lower-cased kind, optionally followed by `:` and the
//! upper-cased, sorted, de-duplicated symbol list: `prices:BTC,ETH`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::BroadcastError;

/// Upper bound on symbols in one subscription.
pub const MAX_SYMBOLS: usize = 64;

fn valid_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

/// What a client subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSpec {
    pub topic: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl TopicSpec {
    pub fn new<I, S>(topic: impl Into<String>, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic: topic.into(),
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    /// Normalize case and symbol order, validating every part.
    pub fn canonicalize(&self) -> Result<TopicSpec, BroadcastError> {
        let topic = self.topic.trim().to_ascii_lowercase();
        if !valid_token(&topic) {
            return Err(BroadcastError::InvalidTopic(format!(
                "invalid topic '{}'",
                self.topic
            )));
        }

        let mut symbols = BTreeSet::new();
        for symbol in &self.symbols {
            let symbol = symbol.trim().to_ascii_uppercase();
            if !valid_token(&symbol) {
                return Err(BroadcastError::InvalidTopic(format!(
                    "invalid symbol '{symbol}' for topic '{topic}'"
                )));
            }
            symbols.insert(symbol);
        }
        if symbols.len() > MAX_SYMBOLS {
            return Err(BroadcastError::InvalidTopic(format!(
                "too many symbols ({} > {MAX_SYMBOLS})",
                symbols.len()
            )));
        }

        Ok(TopicSpec {
            topic,
            symbols: symbols.into_iter().collect(),
        })
    }

    /// Key of an already canonical spec.
    pub fn key(&self) -> String {
        if self.symbols.is_empty() {
            self.topic.clone()
        } else {
            format!("{}:{}", self.topic, self.symbols.join(","))
        }
    }
}
