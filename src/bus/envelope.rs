//! Wire envelope shared by every bus implementation.

use serde::{Deserialize, Serialize};

use super::BusError;
use crate::types::BusMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    /// Name of the component that published the message
    pub correlation_consumer: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub routing_key: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub persistent: bool,
    pub headers: Headers,
    pub body: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed message for publishing
    pub fn wrap<M: BusMessage>(message: &M, publisher: &str) -> Result<Self, BusError> {
        let body = serde_json::to_value(message).map_err(|e| BusError::Encode(e.to_string()))?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            routing_key: message.routing_key(),
            message_type: M::MESSAGE_TYPE.to_string(),
            persistent: true,
            headers: Headers {
                correlation_consumer: publisher.to_string(),
                correlation_id: crate::common::generate_correlation_id(),
                dedup_key: message.dedup_key(),
            },
            body,
        })
    }

    /// Keep the correlation id of the message that caused this one
    pub fn caused_by(mut self, cause: &Envelope) -> Self {
        self.headers.correlation_id = cause.headers.correlation_id.clone();
        self
    }

    /// Decode the body, checking the declared type
    pub fn decode<M: BusMessage>(&self) -> Result<M, BusError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(BusError::Decode(format!(
                "expected {}, got {}",
                M::MESSAGE_TYPE,
                self.message_type
            )));
        }
        serde_json::from_value(self.body.clone()).map_err(|e| BusError::Decode(e.to_string()))
    }
}
