//! Routing view of an instance, and the data-plane seams around it
//!
//! The router info is created on the first request for an instance, mutated
//! only by subscription notifications, and destroyed with the instance. The
//! traits here are the proxy's view of its collaborators: the runtime's
//! data-interface client and the data-plane observer feeding subscription
//! events.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain_types::{EndpointAddress, InstanceId, MessageId, ProxyId, RuntimeId, TenantId};
use crate::error::ErrorCode;
use crate::messages::{MessageBody, NotifyRequest, NotifyResponse, StreamingMessage};
use crate::stream::ControlStream;

/// Data-interface client toward a local runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Sends a call and resolves with the runtime's call response.
    async fn call(&self, request: StreamingMessage) -> Result<StreamingMessage, ErrorCode>;

    /// Delivers a terminal result into the runtime.
    async fn notify_result(&self, request: NotifyRequest) -> Result<NotifyResponse, ErrorCode>;
}

/// Subscription source for instance routing events; the metastore watch in
/// production, an in-memory table in tests.
#[async_trait]
pub trait DataPlaneObserver: Send + Sync {
    /// Subscribes `watcher` to routing changes of `target`. Resolves once
    /// the subscription is established; the events themselves arrive via
    /// `notify_changed` on the owning proxy.
    async fn subscribe_instance_event(
        &self,
        watcher: &InstanceId,
        target: &InstanceId,
        low_reliability: bool,
    ) -> Result<(), ErrorCode>;
}

/// What the proxy caches about one instance's location and readiness.
#[derive(Clone, Default)]
pub struct InstanceRouterInfo {
    /// The instance is co-located with this proxy.
    pub is_local: bool,
    /// The instance is accepting requests.
    pub is_ready: bool,
    /// Tolerates stale readiness downgrades when observed ready remotely.
    pub is_low_reliability: bool,
    pub runtime_id: Option<RuntimeId>,
    /// Owning proxy when the instance lives on another node.
    pub proxy_id: Option<ProxyId>,
    /// Remote endpoint to forward cross-node calls to.
    pub remote: Option<EndpointAddress>,
    pub tenant_id: TenantId,
    pub function: String,
    /// Handle to the runtime's data interface when local.
    pub local_client: Option<Arc<dyn RuntimeClient>>,
}

impl std::fmt::Debug for InstanceRouterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRouterInfo")
            .field("is_local", &self.is_local)
            .field("is_ready", &self.is_ready)
            .field("is_low_reliability", &self.is_low_reliability)
            .field("runtime_id", &self.runtime_id)
            .field("proxy_id", &self.proxy_id)
            .field("remote", &self.remote)
            .field("has_local_client", &self.local_client.is_some())
            .finish_non_exhaustive()
    }
}

/// [`RuntimeClient`] backed by the control stream to a local runtime.
pub struct StreamRuntimeClient {
    stream: ControlStream,
}

impl StreamRuntimeClient {
    #[must_use]
    pub fn new(stream: ControlStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl RuntimeClient for StreamRuntimeClient {
    async fn call(&self, request: StreamingMessage) -> Result<StreamingMessage, ErrorCode> {
        self.stream.send(request).await
    }

    async fn notify_result(&self, request: NotifyRequest) -> Result<NotifyResponse, ErrorCode> {
        let frame = StreamingMessage::new(MessageId::generate(), MessageBody::NotifyReq(request));
        let reply = self.stream.send(frame).await?;
        match reply.body {
            MessageBody::NotifyRsp(response) => Ok(response),
            _ => Err(ErrorCode::InnerCommunication),
        }
    }
}
