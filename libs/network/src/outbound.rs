//! Outbound message queue
//!
//! Classifies every outgoing message and hands it to the sender agent that
//! owns its kind of traffic. Messages for this silo never touch the network.

use crate::message_center::MessageCenter;
use crate::sender::{sender_channel, SenderHandle, SenderQueue};
use crate::stats::MessagePhase;
use chrono::Utc;
use silo_types::{metadata, Category, Direction, HeaderValue, Message, RejectionType, SiloAddress};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Receiving ends of the outbound agents, consumed when the center starts.
pub struct OutboundAgents {
    pub ping: SenderQueue,
    pub system: SenderQueue,
    pub application: Vec<SenderQueue>,
    pub cluster: SenderQueue,
}

pub struct OutboundQueue {
    ping: SenderHandle,
    system: SenderHandle,
    application: Vec<SenderHandle>,
    cluster: SenderHandle,
    /// Cross-cluster messages still sleeping through their WAN delay.
    delayed: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl OutboundQueue {
    /// Queue with `application_senders` hashed application agents.
    pub fn new(application_senders: usize) -> (Self, OutboundAgents) {
        let (ping, ping_rx) = sender_channel("PingSender");
        let (system, system_rx) = sender_channel("SystemSender");
        let (cluster, cluster_rx) = sender_channel("ClusterSender");
        let (application, application_rx): (Vec<_>, Vec<_>) = (0..application_senders.max(1))
            .map(|i| sender_channel(format!("AppMessageSender_{}", i)))
            .unzip();

        (
            Self {
                ping,
                system,
                application,
                cluster,
                delayed: Arc::new(AtomicUsize::new(0)),
                stopped: AtomicBool::new(false),
            },
            OutboundAgents {
                ping: ping_rx,
                system: system_rx,
                application: application_rx,
                cluster: cluster_rx,
            },
        )
    }

    /// Application agent serving `target`. Distinct targets may share one.
    pub fn application_index(&self, target: &SiloAddress) -> usize {
        target.stable_hash() as usize % self.application.len()
    }

    /// Messages queued across every agent, including delayed cross-cluster
    /// messages not yet handed to the cluster sender.
    pub fn count(&self) -> usize {
        self.delayed.load(Ordering::Acquire)
            + self.ping.count()
            + self.system.count()
            + self.cluster.count()
            + self.application.iter().map(SenderHandle::count).sum::<usize>()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn send_message(&self, center: &MessageCenter, mut msg: Message) {
        let stats = center.stats();

        if self.is_stopped() {
            info!(message = %msg, "message was queued for sending after the outbound queue was stopped");
            stats.on_dropped();
            return;
        }

        if center.messaging_config().drop_expired_messages && msg.is_expired() {
            trace!(message = %msg, "dropping expired message before queueing");
            stats.on_expired(MessagePhase::Send);
            return;
        }

        msg.set_metadata(metadata::QUEUED_TIME, HeaderValue::Time(Utc::now()));

        let msg = match center.gateway() {
            Some(gateway) => match gateway.try_deliver_to_proxy(msg) {
                Ok(()) => return,
                Err(msg) => msg,
            },
            None => msg,
        };

        let Some(target) = msg.target_silo else {
            warn!(message = %msg, "message to be sent does not have a target silo");
            center.send_rejection(
                &msg,
                RejectionType::FutureTransient,
                "Message to be sent does not have a target silo",
            );
            return;
        };

        let me = center.my_address();
        if target.matches(&me) {
            trace!(message = %msg, "looping message back to this silo");
            stats.on_local_loopback();
            let client_grain = msg
                .target_grain
                .filter(|g| g.is_client() || g.is_client_addressable_object());
            if let Some(grain) = client_grain {
                if msg.direction == Direction::Request {
                    center.send_rejection(
                        &msg,
                        RejectionType::FutureTransient,
                        format!("No route to client {}", grain),
                    );
                } else {
                    debug!(message = %msg, "no route to client, dropping message");
                    stats.on_dropped();
                }
                return;
            }
            center.inbound().post_message(msg);
            return;
        }

        if self.is_stopped() {
            info!(message = %msg, "message was queued for sending after the outbound queue was stopped");
            stats.on_dropped();
            return;
        }

        if !me.is_same_cluster(&target) {
            if !center.is_cluster_messaging_enabled() {
                info!(message = %msg, "cluster messaging is disabled, dropping cross-cluster message");
                stats.on_dropped();
                return;
            }
            let delay = center
                .cluster_config()
                .wan_delay(me.cluster_id, target.cluster_id);
            if delay.is_zero() {
                self.queue(center, &self.cluster, msg);
                return;
            }
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let handle = self.cluster.clone();
                    let delayed = Arc::clone(&self.delayed);
                    let stats = Arc::clone(stats);
                    trace!(message = %msg, delay_ms = delay.as_millis() as u64, "delaying cross-cluster message");
                    delayed.fetch_add(1, Ordering::AcqRel);
                    runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(msg) = handle.queue(msg) {
                            debug!(message = %msg, "cluster sender gone, dropping message");
                            stats.on_dropped();
                        }
                        delayed.fetch_sub(1, Ordering::AcqRel);
                    });
                }
                Err(_) => {
                    warn!(message = %msg, "no runtime to apply WAN delay, sending immediately");
                    self.queue(center, &self.cluster, msg);
                }
            }
            return;
        }

        match msg.category {
            Category::Ping => self.queue(center, &self.ping, msg),
            Category::System => self.queue(center, &self.system, msg),
            Category::Application => {
                let index = self.application_index(&target);
                self.queue(center, &self.application[index], msg);
            }
        }
    }

    fn queue(&self, center: &MessageCenter, handle: &SenderHandle, msg: Message) {
        if let Err(msg) = handle.queue(msg) {
            debug!(agent = handle.name(), message = %msg, "sender agent gone, dropping message");
            center.stats().on_dropped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_index_is_stable() {
        let (queue, _agents) = OutboundQueue::new(4);
        let target = SiloAddress::new("10.0.0.1:11111".parse().unwrap(), 77);
        let index = queue.application_index(&target);
        assert!(index < 4);
        assert_eq!(index, queue.application_index(&target));
        assert_eq!(index, target.stable_hash() as usize % 4);
    }

    #[test]
    fn zero_application_senders_means_one() {
        let (queue, agents) = OutboundQueue::new(0);
        assert_eq!(agents.application.len(), 1);
        assert_eq!(
            queue.application_index(&SiloAddress::new("10.0.0.1:1".parse().unwrap(), 1)),
            0
        );
        assert_eq!(queue.count(), 0);
    }
}
