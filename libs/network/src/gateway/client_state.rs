use crate::connection::Connection;
use parking_lot::Mutex;
use silo_types::{GrainId, Message};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Link {
    connection: Option<Arc<Connection>>,
    disconnected_at: Option<Instant>,
    pending: VecDeque<Message>,
}

/// One connected (or recently connected) client.
///
/// The sender index is fixed when the client is first seen, so every message
/// for the client goes through the same gateway sender.
#[derive(Debug)]
pub struct ClientState {
    id: GrainId,
    sender_index: usize,
    link: Mutex<Link>,
}

impl ClientState {
    pub fn new(id: GrainId, sender_index: usize) -> Self {
        Self {
            id,
            sender_index,
            link: Mutex::new(Link::default()),
        }
    }

    pub fn id(&self) -> GrainId {
        self.id
    }

    pub fn sender_index(&self) -> usize {
        self.sender_index
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.link.lock().connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connection.is_some()
    }

    /// Attach `connection`, returning the one it replaces.
    pub fn record_connection(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut link = self.link.lock();
        link.disconnected_at = None;
        link.connection.replace(connection)
    }

    /// Detach the current connection if it is `key`.
    pub fn record_disconnection(&self, key: u64, now: Instant) -> bool {
        let mut link = self.link.lock();
        match &link.connection {
            Some(current) if current.key() == key => {
                link.connection = None;
                link.disconnected_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn disconnected_since(&self) -> Option<Instant> {
        self.link.lock().disconnected_at
    }

    pub fn ready_to_drop(&self, now: Instant, timeout: Duration) -> bool {
        let link = self.link.lock();
        link.connection.is_none()
            && link
                .disconnected_at
                .map_or(false, |at| now.saturating_duration_since(at) >= timeout)
    }

    pub fn push_pending(&self, msg: Message) {
        self.link.lock().pending.push_back(msg);
    }

    /// Put `msgs` back at the head of the pending queue, keeping their order.
    pub fn requeue_pending(&self, msgs: Vec<Message>) {
        let mut link = self.link.lock();
        for msg in msgs.into_iter().rev() {
            link.pending.push_front(msg);
        }
    }

    /// Up to `max` messages from the head of the pending queue.
    pub fn take_pending(&self, max: usize) -> Vec<Message> {
        let mut link = self.link.lock();
        let n = max.min(link.pending.len());
        link.pending.drain(..n).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.link.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::{Category, Direction, GrainKind};

    #[test]
    fn requeued_messages_keep_their_place() {
        let state = ClientState::new(GrainId::random(GrainKind::Client), 0);
        let msgs: Vec<Message> = (0..5)
            .map(|_| Message::new(Category::Application, Direction::OneWay))
            .collect();
        let ids: Vec<_> = msgs.iter().map(|m| m.id).collect();
        for msg in msgs {
            state.push_pending(msg);
        }

        let head = state.take_pending(3);
        assert_eq!(head.len(), 3);
        assert_eq!(state.pending_count(), 2);
        state.requeue_pending(head);

        let all: Vec<_> = state.take_pending(10).iter().map(|m| m.id).collect();
        assert_eq!(all, ids);
        assert!(state.take_pending(1).is_empty());
    }
}
