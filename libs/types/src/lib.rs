//! # Silo Types
//!
//! Addressing and message types shared by every layer of the silo messaging
//! transport.
//!
//! - [`SiloAddress`]: endpoint + generation + cluster id of a runtime node
//! - [`GrainId`] / [`ActivationId`]: logical actor and running instance
//! - [`Message`]: typed routing fields, a wire header map, process-local
//!   metadata and an opaque segmented body
//!
//! ```rust
//! use silo_types::{Category, Direction, GrainId, GrainKind, Message};
//!
//! let target = GrainId::random(GrainKind::Grain);
//! let msg = Message::new(Category::Application, Direction::Request)
//!     .with_target(None, target);
//! assert!(msg.target_silo.is_none());
//! ```

pub mod address;
pub mod ids;
pub mod message;

pub use address::{AddressParseError, SiloAddress, DEFAULT_CLUSTER_ID};
pub use ids::{ActivationId, CorrelationId, GrainId, GrainKind};
pub use message::{
    header, metadata, Category, Direction, HeaderValue, Message, Rejection, RejectionType,
    ResponseType,
};
