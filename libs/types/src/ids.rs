//! Logical actor identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What kind of addressable object a [`GrainId`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrainKind {
    /// Ordinary application grain placed by the directory.
    Grain,
    /// Per-silo system service, addressed together with a silo.
    SystemTarget,
    /// External client connected through a gateway.
    Client,
    /// Object living inside a client (observer) that silos can call back.
    ClientAddressableObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainId {
    pub kind: GrainKind,
    pub key: Uuid,
}

const MEMBERSHIP_TABLE_KEY: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0005);

impl GrainId {
    pub fn new(kind: GrainKind, key: Uuid) -> Self {
        Self { kind, key }
    }

    pub fn grain(key: Uuid) -> Self {
        Self::new(GrainKind::Grain, key)
    }

    pub fn client(key: Uuid) -> Self {
        Self::new(GrainKind::Client, key)
    }

    pub fn system_target(key: Uuid) -> Self {
        Self::new(GrainKind::SystemTarget, key)
    }

    pub fn client_addressable_object(key: Uuid) -> Self {
        Self::new(GrainKind::ClientAddressableObject, key)
    }

    pub fn random(kind: GrainKind) -> Self {
        Self::new(kind, Uuid::new_v4())
    }

    /// The membership table grain; its traffic keeps flowing while a silo is
    /// blocking application messages during shutdown.
    pub fn membership_table() -> Self {
        Self::system_target(MEMBERSHIP_TABLE_KEY)
    }

    pub fn is_client(&self) -> bool {
        self.kind == GrainKind::Client
    }

    pub fn is_system_target(&self) -> bool {
        self.kind == GrainKind::SystemTarget
    }

    pub fn is_client_addressable_object(&self) -> bool {
        self.kind == GrainKind::ClientAddressableObject
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            GrainKind::Grain => "grn",
            GrainKind::SystemTarget => "sys",
            GrainKind::Client => "cli",
            GrainKind::ClientAddressableObject => "obj",
        };
        write!(f, "{}/{}", prefix, self.key.simple())
    }
}

/// Identifier of one running instance of a grain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub Uuid);

impl ActivationId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act/{}", self.0.simple())
    }
}

/// Correlates a request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
