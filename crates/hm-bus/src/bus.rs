//! Transport abstraction.
//!
//! Subjects are plain strings. A subscription is an `mpsc` channel that
//! yields every message published to its subject, in arrival order.
//! Request/reply follows the inbox pattern: the request carries a unique
//! reply subject and the caller waits on it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::{BusError, BusResult};

/// A message as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Where a responder should publish its reply.
    pub reply_to: Option<String>,
}

impl Message {
    /// Decode the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> BusResult<T> {
        serde_json::from_slice(&self.payload).map_err(|source| BusError::Decode {
            subject: self.subject.clone(),
            source,
        })
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish with a reply subject attached.
    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> BusResult<()>;

    async fn subscribe(&self, subject: &str) -> BusResult<mpsc::Receiver<Message>>;

    /// Publish on `subject` and wait up to `timeout` for the first reply.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<Message> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox).await?;
        self.publish_request(subject, &inbox, payload).await?;
        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }
}

/// Encode `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    subject: &str,
    value: &T,
) -> BusResult<()> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(subject, payload).await
}
