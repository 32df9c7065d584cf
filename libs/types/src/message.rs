//! Message - the unit of transport between silos and clients
//!
//! Routing fields (addresses, grain ids, expiration, result) are typed. Protocol
//! flags travel in a string-keyed header map that is serialized with the
//! message. Metadata is a second map that only lives inside one process and is
//! never written to the wire.

use crate::address::SiloAddress;
use crate::ids::{ActivationId, CorrelationId, GrainId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Header keys carried on the wire.
pub mod header {
    /// Set by a sender that wants the receiving silo to re-resolve the target.
    pub const REROUTING_REQUESTED: &str = "#RR";
    /// Marks liveness probes answered directly by the acceptor.
    pub const PING: &str = "!Ping";
}

/// Metadata keys; local to one process.
pub mod metadata {
    pub const QUEUED_TIME: &str = "QueuedTime";
    pub const RETRY_COUNT: &str = "RetryCount";
    pub const MAX_RETRIES: &str = "MaxRetries";
}

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Ping,
    System,
    Application,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Ping, Category::System, Category::Application];

    pub fn index(self) -> usize {
        match self {
            Category::Ping => 0,
            Category::System => 1,
            Category::Application => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Response,
    OneWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    Success,
    Error,
    Rejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    Transient,
    /// Retriable by the caller at a higher level.
    FutureTransient,
    DuplicateRequest,
    Unrecoverable,
    GatewayTooBusy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Flag(bool),
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionType,
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: CorrelationId,
    pub category: Category,
    pub direction: Direction,
    pub result: ResponseType,
    pub rejection: Option<Rejection>,
    pub sending_silo: Option<SiloAddress>,
    pub target_silo: Option<SiloAddress>,
    pub sending_grain: Option<GrainId>,
    pub sending_activation: Option<ActivationId>,
    pub target_grain: Option<GrainId>,
    pub target_activation: Option<ActivationId>,
    pub expiration: Option<DateTime<Utc>>,
    headers: BTreeMap<String, HeaderValue>,
    #[serde(skip)]
    metadata: BTreeMap<String, HeaderValue>,
    #[serde(skip)]
    body: Vec<Bytes>,
}

impl Message {
    pub fn new(category: Category, direction: Direction) -> Self {
        Self {
            id: CorrelationId(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)),
            category,
            direction,
            result: ResponseType::Success,
            rejection: None,
            sending_silo: None,
            target_silo: None,
            sending_grain: None,
            sending_activation: None,
            target_grain: None,
            target_activation: None,
            expiration: None,
            headers: BTreeMap::new(),
            metadata: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Liveness probe from `from` to `to`.
    pub fn ping(from: SiloAddress, to: SiloAddress) -> Self {
        let mut msg = Self::new(Category::Ping, Direction::Request);
        msg.sending_silo = Some(from);
        msg.target_silo = Some(to);
        msg.set_header(header::PING, HeaderValue::Flag(true));
        msg
    }

    pub fn with_target(mut self, silo: Option<SiloAddress>, grain: GrainId) -> Self {
        self.target_silo = silo;
        self.target_grain = Some(grain);
        self
    }

    pub fn with_sender(mut self, silo: Option<SiloAddress>, grain: GrainId) -> Self {
        self.sending_silo = silo;
        self.sending_grain = Some(grain);
        self
    }

    pub fn with_body(mut self, body: Vec<Bytes>) -> Self {
        self.body = body;
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expiration = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }

    pub fn is_ping(&self) -> bool {
        self.category == Category::Ping && self.headers.contains_key(header::PING)
    }

    pub fn is_rejection(&self) -> bool {
        self.result == ResponseType::Rejection
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(false, |deadline| now > deadline)
    }

    /// Response addressed back to whoever sent this message.
    ///
    /// Addresses and grain ids are swapped; id, category and expiration carry
    /// over so the caller can correlate and time out the response.
    pub fn create_response(&self) -> Message {
        let mut response = Message::new(self.category, Direction::Response);
        response.id = self.id;
        response.target_silo = self.sending_silo;
        response.target_grain = self.sending_grain;
        response.target_activation = self.sending_activation;
        response.sending_silo = self.target_silo;
        response.sending_grain = self.target_grain;
        response.sending_activation = self.target_activation;
        response.expiration = self.expiration;
        response
    }

    pub fn create_rejection(&self, kind: RejectionType, info: impl Into<String>) -> Message {
        let mut response = self.create_response();
        response.result = ResponseType::Rejection;
        response.rejection = Some(Rejection {
            kind,
            info: info.into(),
        });
        response
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: HeaderValue) {
        self.headers.insert(key.into(), value);
    }

    pub fn remove_header(&mut self, key: &str) -> Option<HeaderValue> {
        self.headers.remove(key)
    }

    pub fn is_rerouting_requested(&self) -> bool {
        matches!(
            self.headers.get(header::REROUTING_REQUESTED),
            Some(HeaderValue::Flag(true))
        )
    }

    pub fn set_rerouting_requested(&mut self) {
        self.set_header(header::REROUTING_REQUESTED, HeaderValue::Flag(true));
    }

    pub fn metadata(&self, key: &str) -> Option<&HeaderValue> {
        self.metadata.get(key)
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: HeaderValue) {
        self.metadata.insert(key.into(), value);
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata_count(metadata::RETRY_COUNT).unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.set_metadata(metadata::RETRY_COUNT, HeaderValue::Int(i64::from(count)));
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.metadata_count(metadata::MAX_RETRIES)
    }

    pub fn set_max_retries(&mut self, max: u32) {
        self.set_metadata(metadata::MAX_RETRIES, HeaderValue::Int(i64::from(max)));
    }

    pub fn queued_time(&self) -> Option<DateTime<Utc>> {
        match self.metadata.get(metadata::QUEUED_TIME) {
            Some(HeaderValue::Time(t)) => Some(*t),
            _ => None,
        }
    }

    fn metadata_count(&self, key: &str) -> Option<u32> {
        match self.metadata.get(key) {
            Some(HeaderValue::Int(n)) => u32::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn body(&self) -> &[Bytes] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<Bytes>) {
        self.body = body;
    }

    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.direction, self.category)?;
        if self.result != ResponseType::Success {
            write!(f, " {:?}", self.result)?;
        }
        write!(f, " #{} ", self.id)?;
        fmt_endpoint(f, self.sending_silo.as_ref(), self.sending_grain.as_ref())?;
        write!(f, " -> ")?;
        fmt_endpoint(f, self.target_silo.as_ref(), self.target_grain.as_ref())?;
        if let Some(rejection) = &self.rejection {
            write!(f, " [{:?}: {}]", rejection.kind, rejection.info)?;
        }
        Ok(())
    }
}

fn fmt_endpoint(
    f: &mut fmt::Formatter<'_>,
    silo: Option<&SiloAddress>,
    grain: Option<&GrainId>,
) -> fmt::Result {
    match silo {
        Some(silo) => write!(f, "{}", silo)?,
        None => write!(f, "?")?,
    }
    if let Some(grain) = grain {
        write!(f, ":{}", grain)?;
    }
    Ok(())
}
