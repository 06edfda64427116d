use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{Connection, Delivery, Link, Transport, DEFAULT_INBOX_CAPACITY};
use gust_core::{GustError, Result, TopicFilter};

/// How the loopback endpoint treats client publishes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EchoMode {
    /// Route every publish to matching subscriptions after `delay`
    Echo { delay: Duration },
    /// Accept publishes but never deliver them
    Silent,
}

#[derive(Debug)]
struct Session {
    client_id: String,
    filters: Vec<TopicFilter>,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Debug)]
struct BrokerInner {
    mode: EchoMode,
    sessions: DashMap<Uuid, Session>,
    refuse_remaining: AtomicUsize,
    stall_remaining: AtomicUsize,
    published: AtomicU64,
    delivered: AtomicU64,
    overflowed: AtomicU64,
}

/// In-process publish/subscribe endpoint for smoke runs and tests
#[derive(Debug, Clone)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl LoopbackBroker {
    pub fn new(mode: EchoMode) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                mode,
                sessions: DashMap::new(),
                refuse_remaining: AtomicUsize::new(0),
                stall_remaining: AtomicUsize::new(0),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                overflowed: AtomicU64::new(0),
            }),
        }
    }

    pub fn echo() -> Self {
        Self::new(EchoMode::Echo {
            delay: Duration::ZERO,
        })
    }

    pub fn echo_with_delay(delay: Duration) -> Self {
        Self::new(EchoMode::Echo { delay })
    }

    pub fn silent() -> Self {
        Self::new(EchoMode::Silent)
    }

    /// Fail the next `n` connection attempts
    pub fn refuse_connections(&self, n: usize) -> &Self {
        self.inner.refuse_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Never answer the next `n` connection attempts
    pub fn stall_connections(&self, n: usize) -> &Self {
        self.inner.stall_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            broker: self.clone(),
        }
    }

    /// Deliver a message as if an outside publisher sent it, regardless of mode
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.route(topic, Bytes::from(payload), Duration::ZERO);
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.inner.overflowed.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        match self.inner.mode {
            EchoMode::Echo { delay } => self.route(topic, Bytes::from(payload), delay),
            EchoMode::Silent => {}
        }
    }

    fn route(&self, topic: &str, payload: Bytes, delay: Duration) {
        // Collect senders first so no map shard stays locked while sending
        let targets: Vec<(String, mpsc::Sender<Delivery>)> = self
            .inner
            .sessions
            .iter()
            .filter(|s| s.filters.iter().any(|f| f.matches(topic)))
            .map(|s| (s.client_id.clone(), s.tx.clone()))
            .collect();

        for (client_id, tx) in targets {
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if delay.is_zero() {
                match tx.try_send(delivery) {
                    Ok(()) => {
                        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.overflowed.fetch_add(1, Ordering::Relaxed);
                        debug!("Loopback inbox full for {}", client_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            } else {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(delivery).await.is_ok() {
                        inner.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        }
    }
}

/// Transport handle onto a [`LoopbackBroker`]
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    broker: LoopbackBroker,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, client_id: &str) -> Result<Connection> {
        if LoopbackBroker::take_one(&self.broker.inner.stall_remaining) {
            debug!("Loopback stalling connection for {}", client_id);
            std::future::pending::<()>().await;
        }
        if LoopbackBroker::take_one(&self.broker.inner.refuse_remaining) {
            return Err(GustError::Connection(format!(
                "Loopback endpoint refused {}",
                client_id
            )));
        }

        let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        let session_id = Uuid::new_v4();
        self.broker.inner.sessions.insert(
            session_id,
            Session {
                client_id: client_id.to_string(),
                filters: Vec::new(),
                tx,
            },
        );

        let link = LoopbackLink {
            broker: self.broker.clone(),
            session_id,
        };
        Ok(Connection::new(client_id.to_string(), Box::new(link), rx))
    }

    fn describe(&self) -> String {
        match self.broker.inner.mode {
            EchoMode::Echo { delay } => format!("loopback (echo, {:?} delay)", delay),
            EchoMode::Silent => "loopback (silent)".to_string(),
        }
    }
}

struct LoopbackLink {
    broker: LoopbackBroker,
    session_id: Uuid,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        let filter = TopicFilter::new(filter)?;
        match self.broker.inner.sessions.get_mut(&self.session_id) {
            Some(mut session) => {
                session.filters.push(filter);
                Ok(())
            }
            None => Err(GustError::Connection("Session closed".to_string())),
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.broker.publish(topic, payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.broker.inner.sessions.remove(&self.session_id);
        Ok(())
    }
}
