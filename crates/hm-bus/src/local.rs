//! In-process message bus.
//!
//! Fans every publish out to all live subscribers of the exact subject.
//! Closed subscriptions are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::bus::{Message, MessageBus};
use crate::error::{BusError, BusResult};

const DEFAULT_CAPACITY: usize = 1024;

pub struct LocalBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Message>>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Each subscription buffers up to `capacity` messages before
    /// publishers wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn senders(&self, subject: &str) -> BusResult<Vec<mpsc::Sender<Message>>> {
        let mut subscribers = self.subscribers.lock().map_err(|_| BusError::Closed)?;
        let Some(senders) = subscribers.get_mut(subject) else {
            return Ok(Vec::new());
        };
        senders.retain(|tx| !tx.is_closed());
        Ok(senders.clone())
    }

    async fn deliver(&self, message: Message) -> BusResult<()> {
        let senders = self.senders(&message.subject)?;
        trace!(subject = %message.subject, subscribers = senders.len(), "publish");
        for tx in senders {
            // A subscriber that went away between lookup and send is not
            // the publisher's problem.
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.deliver(Message {
            subject: subject.to_string(),
            payload,
            reply_to: None,
        })
        .await
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        self.deliver(Message {
            subject: subject.to_string(),
            payload,
            reply_to: Some(reply_to.to_string()),
        })
        .await
    }

    async fn subscribe(&self, subject: &str) -> BusResult<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .map_err(|_| BusError::Closed)?
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
