use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use gust_core::{GustError, Result, TopicFilter};

/// Inbox depth per connection; deliveries beyond this are dropped
pub const DEFAULT_INBOX_CAPACITY: usize = 1000;

/// A message delivered to a connection by the endpoint
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

/// Outbound half of a connection
#[async_trait]
pub trait Link: Send {
    async fn subscribe(&mut self, filter: &str) -> Result<()>;
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// An open session with a messaging endpoint.
///
/// Publishing goes through the link; everything the endpoint routes to this
/// session's subscriptions arrives on the inbox.
pub struct Connection {
    client_id: String,
    link: Box<dyn Link>,
    inbox: mpsc::Receiver<Delivery>,
    open: bool,
}

impl Connection {
    pub fn new(client_id: String, link: Box<dyn Link>, inbox: mpsc::Receiver<Delivery>) -> Self {
        Self {
            client_id,
            link,
            inbox,
            open: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.client_id
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub async fn subscribe(&mut self, filter: &str) -> Result<()> {
        // Reject malformed filters before they reach the endpoint
        TopicFilter::new(filter)?;
        self.ensure_open()?;
        let result = self.link.subscribe(filter).await;
        self.track(result)
    }

    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let result = self.link.publish(topic, payload).await;
        self.track(result)
    }

    /// Wait for the next delivery. Cancel safe.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.inbox.try_recv().ok()
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.inbox.close();
        self.open = false;
        debug!("Disconnecting {}", self.client_id);
        self.link.close().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(GustError::Connection("No active connection".to_string()))
        }
    }

    // A link that lost its endpoint stays closed
    fn track(&mut self, result: Result<()>) -> Result<()> {
        if matches!(result, Err(GustError::Io(_)) | Err(GustError::Connection(_))) {
            self.open = false;
        }
        result
    }
}
