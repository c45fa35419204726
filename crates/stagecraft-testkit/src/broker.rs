//! An in-memory, transactional broker double good enough to exercise
//! every invariant in `stagecraft-core` without a running broker.
//!
//! Queues are a shared `HashMap<String, VecDeque<RawMessage>>`. Each
//! session opened against the same [`InMemoryBrokerFactory`] shares
//! that map but keeps its own pending buffer: sends are held until
//! `commit` flushes them onto their queue, and received messages are
//! tracked so `rollback` can push them back onto the head of their
//! queue, simulating broker redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagecraft_core::broker::{Broker, BrokerSessionFactory, RawMessage};
use tokio::sync::Mutex;
use tokio::time::Instant;

type Queues = Arc<Mutex<HashMap<String, VecDeque<RawMessage>>>>;

/// Shared backing store for one test's worth of queues. Open as many
/// sessions against it as the test needs workers/initiators.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBrokerFactory {
    queues: Queues,
}

impl InMemoryBrokerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message directly, bypassing any transaction — for
    /// seeding a test's first message without going through an
    /// [`stagecraft_core::initiator::Initiator`].
    pub async fn seed(&self, queue_id: impl Into<String>, body: Vec<u8>, headers: HashMap<String, String>) {
        self.queues
            .lock()
            .await
            .entry(queue_id.into())
            .or_default()
            .push_back(RawMessage::new(body, headers));
    }

    /// Number of messages currently sitting on `queue_id`, committed or
    /// not yet received. Useful for asserting nothing (or exactly one
    /// thing) is left in flight at the end of a scenario.
    pub async fn queue_len(&self, queue_id: &str) -> usize {
        self.queues.lock().await.get(queue_id).map(VecDeque::len).unwrap_or(0)
    }
}

#[async_trait]
impl BrokerSessionFactory for InMemoryBrokerFactory {
    async fn open_session(&self) -> anyhow::Result<Arc<dyn Broker>> {
        Ok(Arc::new(InMemoryBrokerSession {
            queues: self.queues.clone(),
            pending_sends: Mutex::new(Vec::new()),
            pending_receives: Mutex::new(Vec::new()),
        }))
    }
}

struct InMemoryBrokerSession {
    queues: Queues,
    pending_sends: Mutex<Vec<(String, RawMessage)>>,
    pending_receives: Mutex<Vec<(String, RawMessage)>>,
}

#[async_trait]
impl Broker for InMemoryBrokerSession {
    async fn receive(&self, queue_id: &str, timeout: Duration) -> anyhow::Result<Option<RawMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queues = self.queues.lock().await;
                if let Some(msg) = queues.get_mut(queue_id).and_then(VecDeque::pop_front) {
                    self.pending_receives.lock().await.push((queue_id.to_string(), msg.clone()));
                    return Ok(Some(msg));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5).min(timeout)).await;
        }
    }

    async fn send(&self, queue_id: &str, body: Vec<u8>, headers: HashMap<String, String>) -> anyhow::Result<()> {
        self.pending_sends.lock().await.push((queue_id.to_string(), RawMessage::new(body, headers)));
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.pending_receives.lock().await.clear();
        let sends = std::mem::take(&mut *self.pending_sends.lock().await);
        let mut queues = self.queues.lock().await;
        for (queue_id, msg) in sends {
            queues.entry(queue_id).or_default().push_back(msg);
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.pending_sends.lock().await.clear();
        let receives = std::mem::take(&mut *self.pending_receives.lock().await);
        let mut queues = self.queues.lock().await;
        for (queue_id, msg) in receives.into_iter().rev() {
            queues.entry(queue_id).or_default().push_front(msg);
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
