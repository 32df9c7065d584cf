//! Message center
//!
//! Owns the inbound and outbound queues, the optional gateway, the listeners
//! and every background task. Build it with [`MessageCenterBuilder`], then
//! call [`MessageCenter::start`] to spawn the agents.
//!
//! ```rust,no_run
//! use silo_config::SiloConfig;
//! use silo_network::MessageCenterBuilder;
//! use silo_types::Category;
//!
//! # async fn run() -> silo_network::Result<()> {
//! let config = SiloConfig::local("silo-a", "127.0.0.1:11111".parse().unwrap());
//! let center = MessageCenterBuilder::new(config).build().await?;
//! center.start()?;
//! while let Some(msg) = center.receive(Category::Application).await {
//!     center.send_message(msg.create_response());
//! }
//! # Ok(())
//! # }
//! ```

use crate::acceptor::{run_acceptor, SiloAcceptor};
use crate::connection::ReceiveSettings;
use crate::connection_cache::{ConnectionCache, TcpConnectionCache};
use crate::directory::{GrainDirectory, StaticDirectory};
use crate::error::{Result, TransportError};
use crate::gateway::{run_gateway_sender, ClientDropHook, Gateway, GatewayAcceptor, OutgoingClientMessage};
use crate::inbound::InboundQueue;
use crate::outbound::{OutboundAgents, OutboundQueue};
use crate::sender::{run_sender, ClusterMessageSender, SenderContext, SenderQueue, SiloMessageSender};
use crate::shutdown::{ShutdownParticipant, ShutdownPhase, ShutdownTrigger};
use crate::stats::{MessagingStats, StatsSnapshot};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use silo_codec::{BincodeCodec, FramingMode, MessageCodec};
use silo_config::{ClusterConfig, MessagingConfig, SiloConfig};
use silo_types::{Category, Direction, GrainId, Message, RejectionType, SiloAddress};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Replaces the default directory-based reroute.
pub type RerouteHook = Arc<dyn Fn(Message) + Send + Sync>;

/// Observes every message the silo acceptor handles.
pub type SniffHook = Arc<dyn Fn(&Message) + Send + Sync>;

const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MessageCenterBuilder {
    config: SiloConfig,
    directory: Option<Arc<dyn GrainDirectory>>,
    codec: Option<Arc<dyn MessageCodec>>,
    connections: Option<Arc<dyn ConnectionCache>>,
}

impl MessageCenterBuilder {
    pub fn new(config: SiloConfig) -> Self {
        Self {
            config,
            directory: None,
            codec: None,
            connections: None,
        }
    }

    pub fn directory(mut self, directory: Arc<dyn GrainDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn connection_cache(mut self, connections: Arc<dyn ConnectionCache>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Validate the configuration and bind the listeners.
    pub async fn build(self) -> Result<Arc<MessageCenter>> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), None))?;

        let silo_listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| TransportError::io(format!("bind {}", config.listen), e))?;
        let endpoint = silo_listener
            .local_addr()
            .map_err(|e| TransportError::io("silo listener address", e))?;

        let generation = if config.generation == 0 {
            allocate_generation()
        } else {
            config.generation
        };
        let my_address = SiloAddress::with_cluster(endpoint, generation, config.cluster.cluster_id);

        let stats = Arc::new(MessagingStats::new());
        let (outbound, agents) = OutboundQueue::new(config.messaging.silo_sender_queues);
        let inbound = InboundQueue::new(Arc::clone(&stats), config.messaging.drop_expired_messages);

        let (gateway, gateway_listener, gateway_queues) = match config.gateway_listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| TransportError::io(format!("bind gateway {}", addr), e))?;
                let (gateway, queues) = Gateway::new(
                    my_address,
                    config.messaging.gateway_sender_queues,
                    config.messaging.client_drop_timeout(),
                    config.messaging.reply_route_ttl(),
                    Arc::clone(&stats),
                );
                (Some(gateway), Some(listener), queues)
            }
            None => (None, None, Vec::new()),
        };
        let gateway_address = gateway_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()
            .map_err(|e| TransportError::io("gateway listener address", e))?;

        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticDirectory::from_config(&config.cluster)));
        let codec = self.codec.unwrap_or_else(|| Arc::new(BincodeCodec));
        let connections = self
            .connections
            .unwrap_or_else(|| Arc::new(TcpConnectionCache::new(config.messaging.socket_cache_size)));

        let (shutdown, _) = ShutdownTrigger::new();
        let cluster_messaging = config.cluster.cluster_messaging_enabled;

        info!(
            silo = %my_address,
            gateway = ?gateway_address,
            app_senders = config.messaging.silo_sender_queues,
            batching = config.messaging.use_message_batching,
            "message center created"
        );

        Ok(Arc::new(MessageCenter {
            my_address,
            gateway_address,
            config,
            stats,
            codec,
            directory,
            connections,
            inbound,
            outbound,
            gateway,
            block_application: AtomicBool::new(false),
            overloaded: AtomicBool::new(false),
            cluster_messaging: AtomicBool::new(cluster_messaging),
            reroute_hook: RwLock::new(None),
            sniff_hook: RwLock::new(None),
            shutdown,
            startup: Mutex::new(Some(Startup {
                silo_listener,
                gateway_listener,
                agents,
                gateway_queues,
            })),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// Generation derived from the start time, in seconds since 2010.
fn allocate_generation() -> i32 {
    let epoch = Utc
        .with_ymd_and_hms(2010, 1, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or(0);
    let seconds = Utc::now().timestamp() - epoch;
    i32::try_from(seconds).unwrap_or(i32::MAX).max(1)
}

struct Startup {
    silo_listener: TcpListener,
    gateway_listener: Option<TcpListener>,
    agents: OutboundAgents,
    gateway_queues: Vec<SenderQueue<OutgoingClientMessage>>,
}

pub struct MessageCenter {
    my_address: SiloAddress,
    gateway_address: Option<SocketAddr>,
    config: SiloConfig,
    stats: Arc<MessagingStats>,
    codec: Arc<dyn MessageCodec>,
    directory: Arc<dyn GrainDirectory>,
    connections: Arc<dyn ConnectionCache>,
    inbound: InboundQueue,
    outbound: OutboundQueue,
    gateway: Option<Gateway>,
    block_application: AtomicBool,
    overloaded: AtomicBool,
    cluster_messaging: AtomicBool,
    reroute_hook: RwLock<Option<RerouteHook>>,
    sniff_hook: RwLock<Option<SniffHook>>,
    shutdown: ShutdownTrigger,
    startup: Mutex<Option<Startup>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageCenter {
    /// Spawn acceptors, sender agents and the gateway sweep.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let startup = self
            .startup
            .lock()
            .take()
            .ok_or_else(|| TransportError::configuration("message center already started", None))?;

        let mut tasks = Vec::new();
        let ctx = self.sender_context();
        let Startup {
            silo_listener,
            gateway_listener,
            agents,
            gateway_queues,
        } = startup;

        tasks.push(tokio::spawn(run_acceptor(
            silo_listener,
            Arc::new(SiloAcceptor::new(Arc::clone(self))),
            Arc::clone(self),
            self.shutdown.subscribe(),
        )));

        tasks.push(tokio::spawn(run_sender(
            SiloMessageSender::new("PingSender", Arc::clone(self)),
            agents.ping,
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(run_sender(
            SiloMessageSender::new("SystemSender", Arc::clone(self)),
            agents.system,
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        for (i, queue) in agents.application.into_iter().enumerate() {
            tasks.push(tokio::spawn(run_sender(
                SiloMessageSender::new(format!("AppMessageSender_{}", i), Arc::clone(self)),
                queue,
                ctx.clone(),
                self.shutdown.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(run_sender(
            ClusterMessageSender::new("ClusterSender", Arc::clone(self)),
            agents.cluster,
            ctx,
            self.shutdown.subscribe(),
        )));

        if let Some(listener) = gateway_listener {
            tasks.push(tokio::spawn(run_acceptor(
                listener,
                Arc::new(GatewayAcceptor::new(Arc::clone(self))),
                Arc::clone(self),
                self.shutdown.subscribe(),
            )));
            for (i, queue) in gateway_queues.into_iter().enumerate() {
                tasks.push(tokio::spawn(run_gateway_sender(
                    format!("GatewaySender_{}", i),
                    Arc::clone(self),
                    queue,
                    self.shutdown.subscribe(),
                )));
            }
            tasks.push(tokio::spawn(run_client_cleanup(Arc::clone(self))));
        }

        info!(silo = %self.my_address, tasks = tasks.len(), "message center started");
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    pub fn my_address(&self) -> SiloAddress {
        self.my_address
    }

    /// Bound client endpoint, when the gateway is enabled.
    pub fn gateway_address(&self) -> Option<SocketAddr> {
        self.gateway_address
    }

    pub fn config(&self) -> &SiloConfig {
        &self.config
    }

    pub fn messaging_config(&self) -> &MessagingConfig {
        &self.config.messaging
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.config.cluster
    }

    pub fn stats(&self) -> &Arc<MessagingStats> {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.codec
    }

    pub fn directory(&self) -> &Arc<dyn GrainDirectory> {
        &self.directory
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionCache> {
        &self.connections
    }

    pub fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn gateway(&self) -> Option<&Gateway> {
        self.gateway.as_ref()
    }

    pub fn framing_mode(&self) -> FramingMode {
        FramingMode::from_batching(self.config.messaging.use_message_batching)
    }

    pub fn receive_settings(&self) -> ReceiveSettings {
        ReceiveSettings::from(&self.config.messaging)
    }

    fn sender_context(&self) -> SenderContext {
        SenderContext {
            codec: Arc::clone(&self.codec),
            stats: Arc::clone(&self.stats),
            mode: self.framing_mode(),
            batch_size: self.config.messaging.batch_size(),
            large_message_threshold: self.config.messaging.large_message_warning_threshold,
        }
    }

    /// Send `msg` toward its target silo.
    ///
    /// While application messages are blocked, application traffic other
    /// than rejections and membership-table traffic is dropped.
    pub fn send_message(&self, mut msg: Message) {
        if self.is_blocking_application_messages()
            && msg.category == Category::Application
            && !msg.is_rejection()
            && msg.target_grain != Some(GrainId::membership_table())
        {
            debug!(message = %msg, "dropping application message while stopping");
            self.stats.on_dropped();
            return;
        }
        if msg.sending_silo.is_none() {
            msg.sending_silo = Some(self.my_address);
        }
        self.outbound.send_message(self, msg);
    }

    /// Queue a message that failed to send for another attempt.
    pub(crate) fn resend(&self, msg: Message) {
        self.outbound.send_message(self, msg);
    }

    /// Deliver a locally synthesized rejection of `msg` to this silo's
    /// inbound queue. Only requests are ever rejected.
    pub fn send_rejection(&self, msg: &Message, kind: RejectionType, info: impl Into<String>) {
        if msg.direction != Direction::Request {
            debug!(message = %msg, "not rejecting a non-request message, dropping it");
            self.stats.on_dropped();
            return;
        }
        let mut info = info.into();
        if info.is_empty() {
            info = format!("Rejection from silo {} - Unknown reason.", self.my_address);
        }
        self.stats.on_rejection_sent();
        self.inbound.post_message(msg.create_rejection(kind, info));
    }

    /// Resolve the owner of `msg`'s target grain and send it there.
    ///
    /// Uses the reroute hook when one is installed, otherwise the directory.
    /// A message that cannot be placed is rejected (requests) or dropped.
    pub fn reroute(&self, mut msg: Message) {
        let hook = self.reroute_hook.read().clone();
        if let Some(hook) = hook {
            hook(msg);
            return;
        }

        if msg.target_silo.is_none() {
            match msg.target_grain.and_then(|g| self.directory.lookup_grain(&g)) {
                Some(silo) => msg.target_silo = Some(silo),
                None => {
                    if let Some(gateway) = &self.gateway {
                        msg = match gateway.try_deliver_to_proxy(msg) {
                            Ok(()) => return,
                            Err(msg) => msg,
                        };
                    }
                    let reason = match msg.target_grain {
                        Some(grain) => format!("No route found for grain {}", grain),
                        None => "Message has neither a target silo nor a target grain".to_string(),
                    };
                    warn!(message = %msg, "unable to reroute message");
                    if msg.direction == Direction::Request {
                        self.send_rejection(&msg, RejectionType::FutureTransient, reason);
                    } else {
                        self.stats.on_dropped();
                    }
                    return;
                }
            }
        }
        self.send_message(msg);
    }

    /// Hand a message addressed to this silo to the gateway or the inbound
    /// queue.
    pub(crate) fn deliver_locally(&self, msg: Message) {
        let msg = match &self.gateway {
            Some(gateway) => match gateway.try_deliver_to_proxy(msg) {
                Ok(()) => return,
                Err(msg) => msg,
            },
            None => msg,
        };
        self.inbound.post_message(msg);
    }

    /// Next inbound message of `category`; `None` once stopped.
    pub async fn receive(&self, category: Category) -> Option<Message> {
        self.inbound.pull_next(category).await
    }

    pub fn set_reroute_hook(&self, hook: RerouteHook) {
        *self.reroute_hook.write() = Some(hook);
    }

    pub fn set_sniff_hook(&self, hook: SniffHook) {
        *self.sniff_hook.write() = Some(hook);
    }

    pub(crate) fn run_sniff_hook(&self, msg: &Message) {
        let hook = self.sniff_hook.read().clone();
        if let Some(hook) = hook {
            hook(msg);
        }
    }

    /// Called with each dropped client and the grains it proxied.
    pub fn set_client_drop_hook(&self, hook: ClientDropHook) {
        match &self.gateway {
            Some(gateway) => gateway.set_client_drop_hook(hook),
            None => debug!("no gateway configured, client drop hook ignored"),
        }
    }

    pub fn set_overloaded(&self, overloaded: bool) {
        if self.overloaded.swap(overloaded, Ordering::AcqRel) != overloaded {
            info!(overloaded, "gateway load shedding changed");
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Acquire)
    }

    pub fn set_cluster_messaging(&self, enabled: bool) {
        self.cluster_messaging.store(enabled, Ordering::Release);
    }

    pub fn is_cluster_messaging_enabled(&self) -> bool {
        self.cluster_messaging.load(Ordering::Acquire)
    }

    pub fn block_application_messages(&self) {
        if !self.block_application.swap(true, Ordering::AcqRel) {
            info!(silo = %self.my_address, "blocking application messages");
        }
    }

    pub fn is_blocking_application_messages(&self) -> bool {
        self.block_application.load(Ordering::Acquire)
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.count()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.count()
    }

    /// Stop every component: block application traffic, stop acceptors and
    /// agents, stop the gateway and both queues, close cached connections.
    pub async fn stop(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        info!(silo = %self.my_address, "stopping message center");
        self.block_application_messages();
        self.shutdown.trigger();
        if let Some(gateway) = &self.gateway {
            gateway.stop();
        }
        self.outbound.stop();
        self.inbound.stop();
        self.connections.close_all().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!(silo = %self.my_address, "message center stopped");
    }
}

async fn run_client_cleanup(center: Arc<MessageCenter>) {
    let Some(gateway) = center.gateway() else {
        return;
    };
    let mut shutdown = center.shutdown.subscribe();
    let mut interval = tokio::time::interval(center.messaging_config().gateway_cleanup_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                let dropped = gateway.drop_disconnected_clients(now);
                if !dropped.is_empty() {
                    info!(count = dropped.len(), "dropped disconnected clients");
                }
                gateway.drop_expired_routing_cache_entries(now);
            }
        }
    }
    debug!("client cleanup stopped");
}

#[async_trait]
impl ShutdownParticipant for MessageCenter {
    fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::Messaging
    }

    fn begin_shutdown(&self) {
        debug!(silo = %self.my_address, "messaging shutdown begun");
    }

    fn can_finish_shutdown(&self) -> bool {
        self.inbound.count() == 0 && self.outbound.count() == 0
    }

    async fn finish_shutdown(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_are_positive_and_recent() {
        let generation = allocate_generation();
        // 2020-01-01 is about 315 million seconds after 2010-01-01.
        assert!(generation > 315_000_000);
    }
}
