use crate::api::models::Message;
use crate::error::SubscriptionError;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SNAPSHOT_BUFFER: usize = 16;

/// Full ordered message set of one conversation at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

pub type SnapshotResult = Result<MessageSnapshot, SubscriptionError>;

/// Producer half of a [`Subscription`], owned by the store's feed task.
pub struct SnapshotSink {
    tx: mpsc::Sender<SnapshotResult>,
}

impl SnapshotSink {
    /// Returns false once the consumer is gone; the producer should stop.
    pub async fn deliver(&self, item: SnapshotResult) -> bool {
        self.tx.send(item).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a live feed. Snapshots arrive in production order from a
/// single task. Closing or dropping aborts the producer.
pub struct Subscription {
    conversation_id: String,
    rx: mpsc::Receiver<SnapshotResult>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn<F, Fut>(conversation_id: &str, producer: F) -> Self
    where
        F: FnOnce(SnapshotSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let task = tokio::spawn(producer(SnapshotSink { tx }));
        log::debug!("subscribed to conversation {conversation_id}");
        Self {
            conversation_id: conversation_id.to_string(),
            rx,
            task,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn next(&mut self) -> Option<SnapshotResult> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<SnapshotResult> {
        self.rx.try_recv().ok()
    }

    pub fn close(mut self) {
        self.rx.close();
        self.task.abort();
        log::debug!("unsubscribed from conversation {}", self.conversation_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
