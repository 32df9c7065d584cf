//! Messaging statistics
//!
//! Plain atomic counters shared by every transport component. A
//! [`StatsSnapshot`] captures them for logging or export.

use serde::Serialize;
use silo_types::Category;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where in the pipeline a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessagePhase {
    Send,
    Receive,
    Dispatch,
}

#[derive(Debug, Default)]
struct CategoryCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MessagingStats {
    per_category: [CategoryCounters; 3],
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    batches_sent: AtomicU64,
    batched_messages_sent: AtomicU64,
    expired_at_send: AtomicU64,
    expired_at_receive: AtomicU64,
    expired_at_dispatch: AtomicU64,
    send_failures: AtomicU64,
    serialization_failures: AtomicU64,
    deserialization_failures: AtomicU64,
    resends: AtomicU64,
    rejections_sent: AtomicU64,
    local_loopback: AtomicU64,
    rerouted: AtomicU64,
    dropped: AtomicU64,
    load_shed: AtomicU64,
    corrupt_streams: AtomicU64,
    clients_dropped: AtomicU64,
    gateway_routed: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

/// Point-in-time copy of [`MessagingStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: [u64; 3],
    pub received: [u64; 3],
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub batches_sent: u64,
    pub batched_messages_sent: u64,
    pub expired_at_send: u64,
    pub expired_at_receive: u64,
    pub expired_at_dispatch: u64,
    pub send_failures: u64,
    pub serialization_failures: u64,
    pub deserialization_failures: u64,
    pub resends: u64,
    pub rejections_sent: u64,
    pub local_loopback: u64,
    pub rerouted: u64,
    pub dropped: u64,
    pub load_shed: u64,
    pub corrupt_streams: u64,
    pub clients_dropped: u64,
    pub gateway_routed: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MessagingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message_sent(&self, category: Category, bytes: usize) {
        bump(&self.per_category[category.index()].sent);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_batch_sent(&self, messages: usize) {
        bump(&self.batches_sent);
        self.batched_messages_sent
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn on_message_received(&self, category: Category, bytes: usize) {
        bump(&self.per_category[category.index()].received);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_expired(&self, phase: MessagePhase) {
        match phase {
            MessagePhase::Send => bump(&self.expired_at_send),
            MessagePhase::Receive => bump(&self.expired_at_receive),
            MessagePhase::Dispatch => bump(&self.expired_at_dispatch),
        }
    }

    pub fn on_send_failure(&self) {
        bump(&self.send_failures);
    }

    pub fn on_serialization_failure(&self) {
        bump(&self.serialization_failures);
    }

    pub fn on_deserialization_failure(&self) {
        bump(&self.deserialization_failures);
    }

    pub fn on_resend(&self) {
        bump(&self.resends);
    }

    pub fn on_rejection_sent(&self) {
        bump(&self.rejections_sent);
    }

    pub fn on_local_loopback(&self) {
        bump(&self.local_loopback);
    }

    pub fn on_rerouted(&self) {
        bump(&self.rerouted);
    }

    pub fn on_dropped(&self) {
        bump(&self.dropped);
    }

    pub fn on_load_shed(&self) {
        bump(&self.load_shed);
    }

    pub fn on_corrupt_stream(&self) {
        bump(&self.corrupt_streams);
    }

    pub fn on_client_dropped(&self) {
        bump(&self.clients_dropped);
    }

    pub fn on_gateway_routed(&self) {
        bump(&self.gateway_routed);
    }

    pub fn on_connection_opened(&self) {
        bump(&self.connections_opened);
    }

    pub fn on_connection_closed(&self) {
        bump(&self.connections_closed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            sent: Category::ALL.map(|c| load(&self.per_category[c.index()].sent)),
            received: Category::ALL.map(|c| load(&self.per_category[c.index()].received)),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            batches_sent: load(&self.batches_sent),
            batched_messages_sent: load(&self.batched_messages_sent),
            expired_at_send: load(&self.expired_at_send),
            expired_at_receive: load(&self.expired_at_receive),
            expired_at_dispatch: load(&self.expired_at_dispatch),
            send_failures: load(&self.send_failures),
            serialization_failures: load(&self.serialization_failures),
            deserialization_failures: load(&self.deserialization_failures),
            resends: load(&self.resends),
            rejections_sent: load(&self.rejections_sent),
            local_loopback: load(&self.local_loopback),
            rerouted: load(&self.rerouted),
            dropped: load(&self.dropped),
            load_shed: load(&self.load_shed),
            corrupt_streams: load(&self.corrupt_streams),
            clients_dropped: load(&self.clients_dropped),
            gateway_routed: load(&self.gateway_routed),
            connections_opened: load(&self.connections_opened),
            connections_closed: load(&self.connections_closed),
        }
    }
}

impl StatsSnapshot {
    pub fn sent(&self, category: Category) -> u64 {
        self.sent[category.index()]
    }

    pub fn received(&self, category: Category) -> u64 {
        self.received[category.index()]
    }
}
