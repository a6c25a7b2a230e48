//! Strongly-typed domain values for the control plane
//!
//! Identifier newtypes prevent primitive obsession: an `InstanceId` can never
//! be passed where a `RuntimeId` is expected. All ids are opaque strings on
//! the wire.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Logical execution context owned by a runtime.
#[nutype(derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
), default = "")]
pub struct InstanceId(String);

/// Worker process hosting one or more instances.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct RuntimeId(String);

/// One client invocation; unique within an instance.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct RequestId(String);

/// Distributed trace correlation id.
#[nutype(derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
), default = "")]
pub struct TraceId(String);

/// Tenant owning an instance or call.
#[nutype(derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
), default = "")]
pub struct TenantId(String);

/// The per-node proxy process identity.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct ProxyId(String);

/// The per-node function agent identity.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct AgentId(String);

/// Correlates a streaming reply with its request.
///
/// The message id is the only identity a frame has; bodies are otherwise
/// opaque to the stream layer.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct MessageId(String);

static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(1);

impl MessageId {
    /// Creates a process-unique, monotonically increasing message id.
    #[must_use]
    pub fn generate() -> Self {
        let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("{}-{seq}", process_tag()))
    }
}

macro_rules! id_as_str {
    ($($id:ident),* $(,)?) => {
        $(impl $id {
            /// The id as a borrowed string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                self.as_ref()
            }
        })*
    };
}

id_as_str!(
    InstanceId, RuntimeId, RequestId, TraceId, TenantId, ProxyId, AgentId, MessageId
);

fn process_tag() -> &'static str {
    use std::sync::OnceLock;
    static TAG: OnceLock<String> = OnceLock::new();
    TAG.get_or_init(|| Uuid::new_v4().simple().to_string()[..8].to_string())
}

/// Transport protocol tag of an endpoint address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// In-process or linked-bus delivery.
    #[default]
    Local,
    Tcp,
    Udp,
}

/// Routing key for point-to-point messaging: an opaque name plus a transport
/// URL plus a protocol tag. Two addresses are equal iff all three match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub name: String,
    pub url: String,
    pub protocol: Protocol,
}

impl EndpointAddress {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            protocol: Protocol::Local,
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.url)
    }
}
