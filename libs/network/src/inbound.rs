//! Inbound message queue
//!
//! One lane per message category. Acceptors and the loopback path post
//! messages; the dispatcher pulls them by category and waits while a lane is
//! empty. Stopping the queue wakes every waiting consumer with `None`.

use crate::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::stats::{MessagePhase, MessagingStats};
use silo_types::{Category, Message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

struct Lane {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    depth: AtomicUsize,
}

impl Lane {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }
}

pub struct InboundQueue {
    lanes: [Lane; 3],
    stopped: ShutdownTrigger,
    signal: ShutdownSignal,
    stats: Arc<MessagingStats>,
    drop_expired: bool,
}

impl InboundQueue {
    pub fn new(stats: Arc<MessagingStats>, drop_expired: bool) -> Self {
        let (stopped, signal) = ShutdownTrigger::new();
        Self {
            lanes: [Lane::new(), Lane::new(), Lane::new()],
            stopped,
            signal,
            stats,
            drop_expired,
        }
    }

    fn lane(&self, category: Category) -> &Lane {
        &self.lanes[category.index()]
    }

    pub fn post_message(&self, msg: Message) {
        if self.stopped.is_triggered() {
            debug!(message = %msg, "inbound queue stopped, dropping message");
            self.stats.on_dropped();
            return;
        }
        if self.drop_expired && msg.is_expired() {
            trace!(message = %msg, "dropping expired message at inbound queue");
            self.stats.on_expired(MessagePhase::Receive);
            return;
        }

        let lane = self.lane(msg.category);
        lane.depth.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(msg)) = lane.tx.send(msg) {
            lane.depth.fetch_sub(1, Ordering::AcqRel);
            debug!(message = %msg, "inbound lane closed, dropping message");
            self.stats.on_dropped();
        }
    }

    /// Next message of `category`, waiting while the lane is empty.
    ///
    /// Returns `None` once the queue is stopped.
    pub async fn pull_next(&self, category: Category) -> Option<Message> {
        let lane = self.lane(category);
        let mut rx = lane.rx.lock().await;
        let mut signal = self.signal.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = signal.wait() => return None,
                msg = rx.recv() => msg,
            };
            let msg = next?;
            lane.depth.fetch_sub(1, Ordering::AcqRel);
            if self.drop_expired && msg.is_expired() {
                trace!(message = %msg, "dropping expired message at dispatch");
                self.stats.on_expired(MessagePhase::Dispatch);
                continue;
            }
            return Some(msg);
        }
    }

    /// Messages waiting across every lane.
    pub fn count(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| lane.depth.load(Ordering::Acquire))
            .sum()
    }

    pub fn count_for(&self, category: Category) -> usize {
        self.lane(category).depth.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.trigger();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::Direction;
    use std::time::Duration;

    fn queue() -> InboundQueue {
        InboundQueue::new(Arc::new(MessagingStats::new()), true)
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let queue = queue();
        queue.post_message(Message::new(Category::System, Direction::OneWay));
        queue.post_message(Message::new(Category::Application, Direction::OneWay));
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.count_for(Category::System), 1);

        let msg = queue.pull_next(Category::Application).await.unwrap();
        assert_eq!(msg.category, Category::Application);
        assert_eq!(queue.count_for(Category::Application), 0);
        assert_eq!(queue.count(), 1);
    }

    #[tokio::test]
    async fn expired_messages_never_enter() {
        let queue = queue();
        let mut msg = Message::new(Category::Application, Direction::Request);
        msg.expiration = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        queue.post_message(msg);
        assert_eq!(queue.count(), 0);
        assert_eq!(queue.stats.snapshot().expired_at_receive, 1);
    }

    #[tokio::test]
    async fn stop_wakes_waiting_consumer() {
        let queue = Arc::new(queue());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pull_next(Category::Ping).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());

        queue.post_message(Message::new(Category::Ping, Direction::OneWay));
        assert_eq!(queue.count(), 0);
    }
}
