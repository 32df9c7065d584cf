//! Sender agents
//!
//! Each agent owns one FIFO queue and a background task draining it. For
//! every message (or batch of messages bound for one endpoint) the task runs
//! prepare, connect, serialize, write and post-send in that order. The
//! variants differ only in the hooks of [`OutgoingMessageSender`]:
//!
//! - [`SiloMessageSender`]: ping, system and application traffic inside the
//!   cluster, with a per-target circuit breaker
//! - [`ClusterMessageSender`]: traffic to another cluster's gateway
//!
//! Gateway senders serve clients with a per-client pending queue and live in
//! [`crate::gateway`].

mod cluster;
mod silo;

pub use cluster::ClusterMessageSender;
pub use silo::SiloMessageSender;

use crate::connection::Connection;
use crate::error::SendFailure;
use crate::message_center::MessageCenter;
use crate::shutdown::ShutdownSignal;
use crate::stats::MessagingStats;
use async_trait::async_trait;
use bytes::Bytes;
use silo_codec::{frame_encoded, CodecError, EncodedMessage, FramingMode, MessageCodec};
use silo_types::{Direction, Message, RejectionType, ResponseType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Producer side of an agent queue.
#[derive(Debug)]
pub struct SenderHandle<T = Message> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for SenderHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

/// Consumer side of an agent queue, owned by the agent task.
#[derive(Debug)]
pub struct SenderQueue<T = Message> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicUsize>,
}

pub fn sender_channel<T>(name: impl Into<Arc<str>>) -> (SenderHandle<T>, SenderQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        SenderHandle {
            name: name.into(),
            tx,
            depth: Arc::clone(&depth),
        },
        SenderQueue { rx, depth },
    )
}

impl<T> SenderHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `item`; hands it back if the agent is gone.
    pub fn queue(&self, item: T) -> Result<(), T> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(item).map_err(|mpsc::error::SendError(item)| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            item
        })
    }

    pub fn count(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl<T> SenderQueue<T> {
    pub async fn next(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    pub fn try_next(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }
}

/// Outcome of the prepare step.
#[derive(Debug)]
pub enum Prepared {
    Ready(Message),
    /// The hook already disposed of the message (dropped it, parked it)
    Handled,
    Failed(Message, SendFailure),
}

#[async_trait]
pub trait OutgoingMessageSender: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Check expiry, stamp the sending silo, veto doomed sends.
    fn prepare(&self, msg: Message) -> Prepared;

    /// Connection for the (prepared) message's target.
    async fn connect(&self, msg: &Message) -> Result<Arc<Connection>, SendFailure>;

    async fn on_send_failure(&self, msgs: Vec<Message>, failure: SendFailure);

    fn on_serialization_failure(&self, msg: Message, error: &CodecError);

    fn on_message_sent(&self, _msg: &Message) {}
}

/// Shared settings of every agent loop.
#[derive(Clone)]
pub struct SenderContext {
    pub codec: Arc<dyn MessageCodec>,
    pub stats: Arc<MessagingStats>,
    pub mode: FramingMode,
    pub batch_size: usize,
    pub large_message_threshold: usize,
}

fn endpoint_of(msg: &Message) -> Option<SocketAddr> {
    msg.target_silo.map(|silo| silo.endpoint)
}

/// Agent loop: drain `queue` through `sender` until shutdown.
///
/// Up to `batch_size` consecutive messages bound for the same endpoint share
/// one write. Order within the queue is preserved on the wire.
pub async fn run_sender<S: OutgoingMessageSender>(
    sender: S,
    mut queue: SenderQueue,
    ctx: SenderContext,
    mut shutdown: ShutdownSignal,
) {
    debug!(agent = sender.name(), "sender agent started");
    let mut carried: Option<Message> = None;

    loop {
        let first = match carried.take() {
            Some(msg) => msg,
            None => {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    next = queue.next() => next,
                };
                let Some(msg) = next else { break };
                match sender.prepare(msg) {
                    Prepared::Ready(msg) => msg,
                    Prepared::Handled => continue,
                    Prepared::Failed(msg, failure) => {
                        sender.on_send_failure(vec![msg], failure).await;
                        continue;
                    }
                }
            }
        };

        let endpoint = endpoint_of(&first);
        let mut batch = vec![first];
        while batch.len() < ctx.batch_size {
            let Some(msg) = queue.try_next() else { break };
            match sender.prepare(msg) {
                Prepared::Ready(msg) if endpoint_of(&msg) == endpoint => batch.push(msg),
                Prepared::Ready(msg) => {
                    carried = Some(msg);
                    break;
                }
                Prepared::Handled => {}
                Prepared::Failed(msg, failure) => sender.on_send_failure(vec![msg], failure).await,
            }
        }

        if shutdown.is_triggered() {
            debug!(agent = sender.name(), dropped = batch.len(), "sender stopping, dropping dequeued messages");
            break;
        }
        send_batch(&sender, batch, &ctx).await;
    }

    if let Some(msg) = carried {
        debug!(agent = sender.name(), message = %msg, "sender stopped, dropping dequeued message");
    }
    debug!(agent = sender.name(), "sender agent stopped");
}

async fn send_batch<S: OutgoingMessageSender>(sender: &S, batch: Vec<Message>, ctx: &SenderContext) {
    let connection = match sender.connect(&batch[0]).await {
        Ok(connection) => connection,
        Err(failure) => {
            sender.on_send_failure(batch, failure).await;
            return;
        }
    };

    let mut encoded: Vec<EncodedMessage> = Vec::with_capacity(batch.len());
    let mut ready = Vec::with_capacity(batch.len());
    for msg in batch {
        match ctx.codec.encode(&msg) {
            Ok(bytes) => {
                if bytes.total_len() > ctx.large_message_threshold {
                    warn!(message = %msg, size = bytes.total_len(), "sending large message");
                }
                encoded.push(bytes);
                ready.push(msg);
            }
            Err(e) => sender.on_serialization_failure(msg, &e),
        }
    }
    if ready.is_empty() {
        return;
    }

    let frame = match frame_encoded(&encoded, ctx.mode) {
        Ok(frame) => frame,
        Err(e) => {
            for msg in ready {
                sender.on_serialization_failure(msg, &e);
            }
            return;
        }
    };

    let target = connection.remote();
    let outcome = match connection.write_frame(&frame).await {
        Ok(written) if written == frame.len => Ok(()),
        Ok(written) => Err(SendFailure::ShortWrite {
            target,
            written,
            expected: frame.len,
        }),
        Err(e) => Err(SendFailure::Write {
            target,
            reason: e.to_string(),
        }),
    };

    match outcome {
        Ok(()) => {
            for (msg, bytes) in ready.iter().zip(&encoded) {
                ctx.stats.on_message_sent(msg.category, bytes.total_len());
                sender.on_message_sent(msg);
            }
            if ctx.mode == FramingMode::Batched {
                ctx.stats.on_batch_sent(ready.len());
            }
            trace!(agent = sender.name(), peer = %target, messages = ready.len(), "sent");
        }
        Err(failure) => {
            warn!(agent = sender.name(), peer = %target, error = %failure, "send failed");
            sender.on_send_failure(ready, failure).await;
        }
    }
}

/// Resend `msg` while it has retries left, otherwise fail it.
///
/// Only socket-level failures are retried. The running count lives in the
/// message's metadata; the limit comes from the message or the configured
/// default.
pub(crate) fn retry_or_fail(center: &MessageCenter, mut msg: Message, failure: &SendFailure) {
    let max_retries = msg
        .max_retries()
        .unwrap_or(center.messaging_config().max_resend_count);
    let retries = msg.retry_count();

    if failure.is_retryable() && retries < max_retries {
        msg.set_retry_count(retries + 1);
        center.stats().on_resend();
        debug!(message = %msg, attempt = retries + 1, max_retries, error = %failure, "resending message");
        center.resend(msg);
        return;
    }

    if failure.is_retryable() {
        if let Some(target) = msg.target_silo {
            center.directory().invalidate_cached_route(&target);
        }
    }
    fail_message(center, msg, failure);
}

/// Terminal failure: requests are rejected back to the sender, anything else
/// is dropped.
pub(crate) fn fail_message(center: &MessageCenter, msg: Message, reason: &SendFailure) {
    center.stats().on_send_failure();
    if msg.direction == Direction::Request {
        let info = format!(
            "Silo {} is rejecting message: {}. Reason = {}",
            center.my_address(),
            msg,
            reason
        );
        debug!(message = %msg, reason = %reason, "rejecting message");
        center.send_rejection(&msg, RejectionType::FutureTransient, info);
    } else {
        info!(message = %msg, reason = %reason, "dropping message");
        center.stats().on_dropped();
    }
}

/// A request that cannot be serialized is rejected; a response that cannot
/// be serialized is turned into an error response and sent once more.
pub(crate) fn handle_serialization_failure(center: &MessageCenter, mut msg: Message, error: &CodecError) {
    warn!(message = %msg, error = %error, "unexpected error serializing message");
    center.stats().on_serialization_failure();

    match msg.direction {
        Direction::Request => {
            center.send_rejection(&msg, RejectionType::Unrecoverable, error.to_string());
        }
        Direction::Response if msg.result != ResponseType::Error => {
            msg.result = ResponseType::Error;
            msg.set_body(vec![Bytes::from(error.to_string())]);
            center.send_message(msg);
        }
        _ => center.stats().on_dropped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::Category;

    #[tokio::test]
    async fn queue_depth_tracks_items() {
        let (handle, mut queue) = sender_channel::<Message>("test");
        assert_eq!(handle.name(), "test");
        handle
            .queue(Message::new(Category::System, Direction::OneWay))
            .unwrap();
        handle
            .queue(Message::new(Category::System, Direction::OneWay))
            .unwrap();
        assert_eq!(handle.count(), 2);

        queue.next().await.unwrap();
        assert_eq!(handle.count(), 1);
        queue.try_next().unwrap();
        assert!(queue.try_next().is_none());
        assert_eq!(handle.count(), 0);
    }

    #[test]
    fn queue_returns_item_when_agent_is_gone() {
        let (handle, queue) = sender_channel::<u32>("gone");
        drop(queue);
        assert_eq!(handle.queue(7), Err(7));
        assert_eq!(handle.count(), 0);
    }
}
