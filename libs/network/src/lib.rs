//! # Silo Network - Messaging Transport
//!
//! Moves messages between silos of a cluster, between clusters through their
//! gateways, and between a silo and the external clients connected to it.
//!
//! - [`message_center`]: owns every queue, listener and agent; the API the
//!   runtime talks to
//! - [`outbound`] / [`inbound`]: classification of outgoing messages and the
//!   per-category queues of received ones
//! - [`sender`]: agent loops that batch, frame and write messages, with the
//!   retry and rejection policy for failed sends
//! - [`acceptor`]: listener loops and the silo-to-silo receive path
//! - [`gateway`]: client registry, per-client queues and the client acceptor
//! - [`connection`] / [`connection_cache`]: sockets, handshake, receive loop
//!   and the outgoing connection cache

pub mod acceptor;
pub mod client;
pub mod connection;
pub mod connection_cache;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod inbound;
pub mod message_center;
pub mod outbound;
pub mod sender;
pub mod shutdown;
pub mod stats;

pub use acceptor::{run_acceptor, AcceptorRole, SiloAcceptor};
pub use client::GatewayClient;
pub use connection::{Connection, ConnectionId, ReceiveSettings, DIRECT_CONNECTION_ID};
pub use connection_cache::{ConnectionCache, TcpConnectionCache};
pub use directory::{GrainDirectory, StaticDirectory};
pub use error::{Result, SendFailure, TransportError};
pub use gateway::{ClientDropHook, Gateway, GatewayAcceptor};
pub use inbound::InboundQueue;
pub use message_center::{MessageCenter, MessageCenterBuilder, RerouteHook, SniffHook};
pub use outbound::OutboundQueue;
pub use shutdown::{ShutdownParticipant, ShutdownPhase, ShutdownSignal, ShutdownTrigger};
pub use stats::{MessagePhase, MessagingStats, StatsSnapshot};
