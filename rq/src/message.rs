//! Delivery payloads and message properties

use serde::{Deserialize, Serialize};

/// Properties carried alongside a message body
///
/// `reply_to` names the queue a consumer should answer on; `correlation_id`
/// lets the publisher match that answer to its request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "reply-to")]
    pub reply_to: Option<String>,

    #[serde(rename = "correlation-id")]
    pub correlation_id: Option<String>,
}

impl Properties {
    /// Properties for a request expecting a correlated reply
    pub fn request(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Properties for a reply, echoing the request's correlation id
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: None,
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Check whether this message answers the given correlation id
    pub fn correlates_with(&self, correlation_id: &str) -> bool {
        self.correlation_id.as_deref() == Some(correlation_id)
    }
}

/// A message handed to a consumer
///
/// The delivery stays leased (tracked as unacked) until the consumer acks the
/// tag. Recovering the queue returns leased deliveries to the ready queue
/// with `redelivered` set.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Interpret the body as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
