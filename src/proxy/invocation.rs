//! Invoke and call-result entry points off the control stream
//!
//! Invokes pass admission control (token bucket, then memory monitor) before
//! being adapted into calls on the destination instance's proxy. Call
//! results with the `@initcall` suffix are the runtime's create-complete
//! signal and go to the registered create receiver; everything else is
//! routed to the destination instance.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{error, info};

use super::dispatcher::{CallerInfo, call_result_ack};
use super::instance_proxy::ProxyManager;
use crate::domain_types::{InstanceId, MessageId, RequestId, TenantId};
use crate::error::{ErrorCode, Status};
use crate::memory_monitor::MemoryMonitor;
use crate::messages::{
    BodyTag, CallRequest, CallResult, InvokeRequest, InvokeResponse, MessageBody, StreamingMessage,
};
use crate::stream::StreamHandler;

/// Payload size is doubled to approximate the in-flight footprint of a
/// request (wire buffer plus decoded copy).
const MSG_ESTIMATED_FACTOR: u64 = 2;

/// Simple token bucket over invokes; refills continuously.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            refill_per_second,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Decides whether an `@initcall` result is a valid create-complete signal.
#[async_trait]
pub trait CreateCallResultReceiver: Send + Sync {
    /// Returns `(accepted, ack)`. When not accepted the handler rejects the
    /// result, because an init call must be verified by the local scheduler.
    async fn on_create_result(
        &self,
        from: InstanceId,
        result: CallResult,
    ) -> (bool, StreamingMessage);
}

/// Builds the call request the proxy sends onward for an invoke.
fn invoke_to_call(from: &InstanceId, invoke: &InvokeRequest) -> StreamingMessage {
    StreamingMessage::request(MessageBody::CallReq(CallRequest {
        function: invoke.function.clone(),
        request_id: invoke.request_id.clone(),
        trace_id: invoke.trace_id.clone(),
        sender_id: from.clone(),
        args: invoke.args.clone(),
        return_object_ids: invoke.return_object_ids.clone(),
        create_options: invoke.invoke_options.clone(),
    }))
}

fn invoke_response(status: Status, message_id: &MessageId) -> StreamingMessage {
    StreamingMessage::new(
        message_id.clone(),
        MessageBody::InvokeRsp(InvokeResponse { status }),
    )
}

/// Terminates client-facing invokes and call results on this node.
pub struct InvocationHandler {
    proxies: Arc<ProxyManager>,
    memory: Arc<MemoryMonitor>,
    bucket: Mutex<TokenBucket>,
    create_receiver: Mutex<Option<Arc<dyn CreateCallResultReceiver>>>,
    /// Which instance each admitted request was charged against.
    charged: DashMap<RequestId, InstanceId>,
}

impl InvocationHandler {
    #[must_use]
    pub fn new(
        proxies: Arc<ProxyManager>,
        memory: Arc<MemoryMonitor>,
        bucket: TokenBucket,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            proxies,
            memory,
            bucket: Mutex::new(bucket),
            create_receiver: Mutex::new(None),
            charged: DashMap::new(),
        });
        let release = Arc::downgrade(&handler);
        handler.proxies.set_memory_release(Arc::new(
            move |instance_id: &InstanceId, request_id: &RequestId| {
                if let Some(handler) = release.upgrade() {
                    handler.release_charge(instance_id, request_id);
                }
            },
        ));
        handler
    }

    /// Registers the create-complete receiver for `@initcall` results.
    pub fn set_create_result_receiver(&self, receiver: Arc<dyn CreateCallResultReceiver>) {
        *self.create_receiver.lock().expect("receiver lock") = Some(receiver);
    }

    fn release_charge(&self, instance_id: &InstanceId, request_id: &RequestId) {
        let charged_instance = self
            .charged
            .remove(request_id)
            .map_or_else(|| instance_id.clone(), |(_, instance)| instance);
        self.memory.release(&charged_instance, request_id);
    }

    /// Handles one inbound invoke frame and returns the invoke response.
    pub async fn handle_invoke(
        self: &Arc<Self>,
        from: InstanceId,
        request: StreamingMessage,
    ) -> StreamingMessage {
        let MessageBody::InvokeReq(invoke) = &request.body else {
            return invoke_response(
                Status::error(ErrorCode::ParamInvalid, "expected an invoke request"),
                &request.message_id,
            );
        };
        let instance_id = invoke.instance_id.clone();
        if !self.bucket.lock().expect("bucket lock").try_acquire() {
            error!(
                trace = %invoke.trace_id,
                request = %invoke.request_id,
                instance = %instance_id,
                "invoke rate limited by token bucket"
            );
            return invoke_response(
                Status::error(ErrorCode::InvokeRateLimited, "too many concurrent invokes"),
                &request.message_id,
            );
        }
        if self.memory.is_enabled() {
            let estimated = estimated_size(invoke) * MSG_ESTIMATED_FACTOR;
            if !self
                .memory
                .allow(&instance_id, &invoke.request_id, estimated)
            {
                error!(
                    trace = %invoke.trace_id,
                    request = %invoke.request_id,
                    instance = %instance_id,
                    from = %from,
                    "memory usage not enough, reject invoke"
                );
                return invoke_response(
                    Status::error(
                        ErrorCode::InvokeRateLimited,
                        "system memory usage not enough, reject invoke request",
                    ),
                    &request.message_id,
                );
            }
            self.charged
                .insert(invoke.request_id.clone(), instance_id.clone());
        }
        info!(
            trace = %invoke.trace_id,
            request = %invoke.request_id,
            instance = %instance_id,
            from = %from,
            "received invoke"
        );
        let call = invoke_to_call(&from, invoke);
        let caller = CallerInfo {
            instance_id: from.clone(),
            tenant_id: TenantId::default(),
        };
        // Route through the destination instance's proxy if it exists,
        // otherwise through the connection owner's proxy.
        let proxy = match self.proxies.get(&instance_id) {
            Some(proxy) => proxy,
            None => self.proxies.get_or_create(&from, TenantId::default()),
        };
        let response = proxy.call(&caller, &instance_id, call).await.await;
        let status = match response.body {
            MessageBody::CallRsp(rsp) => rsp.status,
            _ => Status::error(ErrorCode::InnerCommunication, "unexpected call response"),
        };
        invoke_response(status, &request.message_id)
    }

    /// Handles one inbound call-result frame and returns the ack.
    pub async fn handle_call_result(
        self: &Arc<Self>,
        from: InstanceId,
        request: StreamingMessage,
    ) -> StreamingMessage {
        let MessageBody::CallResultReq(call_result) = &request.body else {
            return call_result_ack(
                Status::error(ErrorCode::ParamInvalid, "expected a call result"),
                &request.message_id,
            );
        };
        info!(
            request = %call_result.request_id,
            from = %from,
            "received call result"
        );
        if call_result.is_init_call() {
            let receiver = self.create_receiver.lock().expect("receiver lock").clone();
            if let Some(receiver) = receiver {
                let mut bare = call_result.clone();
                bare.request_id = call_result.bare_request_id();
                let (accepted, ack) = receiver.on_create_result(from.clone(), bare).await;
                if accepted {
                    info!(
                        request = %call_result.request_id,
                        from = %from,
                        "call result is a create-complete signal"
                    );
                    return ack;
                }
                // An init call that the scheduler does not recognise is an
                // internal routing failure, not a user-visible result.
                return call_result_ack(
                    Status::error(
                        ErrorCode::InnerCommunication,
                        "init call must be verified by the local scheduler",
                    ),
                    &request.message_id,
                );
            }
        }
        let dst_instance = call_result.instance_id.clone();
        let proxy = match self.proxies.get(&dst_instance) {
            Some(proxy) => proxy,
            None => self.proxies.get_or_create(&from, TenantId::default()),
        };
        proxy.call_result(&from, &dst_instance, request).await
    }

    /// Stream handlers for the tags this component terminates.
    #[must_use]
    pub fn stream_handlers(self: &Arc<Self>) -> Vec<(BodyTag, StreamHandler)> {
        let invoke_handler = Arc::clone(self);
        let invoke: StreamHandler = Arc::new(move |from, message| {
            let handler = Arc::clone(&invoke_handler);
            async move { Ok(handler.handle_invoke(from, message).await) }.boxed()
        });
        let result_handler = Arc::clone(self);
        let call_result: StreamHandler = Arc::new(move |from, message| {
            let handler = Arc::clone(&result_handler);
            async move { Ok(handler.handle_call_result(from, message).await) }.boxed()
        });
        vec![
            (BodyTag::InvokeReq, invoke),
            (BodyTag::CallResultReq, call_result),
        ]
    }
}

fn estimated_size(invoke: &InvokeRequest) -> u64 {
    let overhead = invoke.function.len()
        + invoke.request_id.as_ref().len()
        + invoke.trace_id.as_ref().len();
    (invoke.args.len() + overhead) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NodeBus;
    use crate::memory_monitor::{MemoryControlConfig, MemoryProbe};
    use crate::proxy::router_info::DataPlaneObserver;
    use std::time::Duration;

    struct NullObserver;

    #[async_trait]
    impl DataPlaneObserver for NullObserver {
        async fn subscribe_instance_event(
            &self,
            _watcher: &InstanceId,
            _target: &InstanceId,
            _low_reliability: bool,
        ) -> Result<(), ErrorCode> {
            Ok(())
        }
    }

    struct TinyProbe;

    impl MemoryProbe for TinyProbe {
        fn current(&self) -> u64 {
            0
        }
        fn limit(&self) -> u64 {
            10_000_000_000
        }
    }

    fn handler_with_bucket(capacity: u32) -> Arc<InvocationHandler> {
        let bus = NodeBus::new("node-test");
        let proxies = ProxyManager::new(
            bus,
            Arc::new(NullObserver),
            false,
            Duration::from_millis(10),
        );
        let memory = Arc::new(MemoryMonitor::new(
            MemoryControlConfig::default(),
            Arc::new(TinyProbe),
        ));
        InvocationHandler::new(proxies, memory, TokenBucket::new(capacity, 0.0))
    }

    fn invoke_msg(request_id: &str) -> StreamingMessage {
        StreamingMessage::request(MessageBody::InvokeReq(InvokeRequest {
            instance_id: InstanceId::new("instA".to_string()),
            function: "echo".to_string(),
            request_id: RequestId::new(request_id.to_string()),
            trace_id: crate::domain_types::TraceId::default(),
            args: vec![],
            return_object_ids: vec![],
            invoke_options: std::collections::HashMap::new(),
        }))
    }

    #[tokio::test]
    async fn test_token_bucket_exhaustion_rate_limits() {
        let handler = handler_with_bucket(1);
        let from = InstanceId::new("caller".to_string());

        // First invoke takes the only token; the target instance is not
        // ready so run it in the background.
        let background = Arc::clone(&handler);
        let from_bg = from.clone();
        tokio::spawn(async move {
            let _ = background.handle_invoke(from_bg, invoke_msg("req-1")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = handler.handle_invoke(from, invoke_msg("req-2")).await;
        let MessageBody::InvokeRsp(rsp) = response.body else {
            panic!("expected invoke response");
        };
        assert_eq!(rsp.status.code, Some(ErrorCode::InvokeRateLimited));
    }

    #[test]
    fn test_token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1, 1000.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(10));
        assert!(bucket.try_acquire());
    }

    struct AcceptingReceiver;

    #[async_trait]
    impl CreateCallResultReceiver for AcceptingReceiver {
        async fn on_create_result(
            &self,
            _from: InstanceId,
            result: CallResult,
        ) -> (bool, StreamingMessage) {
            assert_eq!(result.request_id.as_ref(), "req-7");
            (
                true,
                call_result_ack(Status::ok(), &MessageId::generate()),
            )
        }
    }

    fn init_call_result(request_id: &str) -> StreamingMessage {
        StreamingMessage::request(MessageBody::CallResultReq(CallResult {
            instance_id: InstanceId::new("instA".to_string()),
            request_id: RequestId::new(request_id.to_string()),
            status: Status::ok(),
            payload: vec![],
            small_objects: vec![],
        }))
    }

    #[tokio::test]
    async fn test_initcall_routes_to_create_receiver() {
        let handler = handler_with_bucket(10);
        handler.set_create_result_receiver(Arc::new(AcceptingReceiver));

        let ack = handler
            .handle_call_result(
                InstanceId::new("rt-conn".to_string()),
                init_call_result("req-7@initcall"),
            )
            .await;
        let MessageBody::CallResultAck(ack) = ack.body else {
            panic!("expected call result ack");
        };
        assert!(ack.status.is_ok());
    }

    struct RejectingReceiver;

    #[async_trait]
    impl CreateCallResultReceiver for RejectingReceiver {
        async fn on_create_result(
            &self,
            _from: InstanceId,
            _result: CallResult,
        ) -> (bool, StreamingMessage) {
            (
                false,
                call_result_ack(
                    Status::error(ErrorCode::ParamInvalid, "unknown create"),
                    &MessageId::generate(),
                ),
            )
        }
    }

    #[tokio::test]
    async fn test_unverified_initcall_is_inner_communication_error() {
        let handler = handler_with_bucket(10);
        handler.set_create_result_receiver(Arc::new(RejectingReceiver));

        let ack = handler
            .handle_call_result(
                InstanceId::new("rt-conn".to_string()),
                init_call_result("req-7@initcall"),
            )
            .await;
        let MessageBody::CallResultAck(ack) = ack.body else {
            panic!("expected call result ack");
        };
        assert_eq!(ack.status.code, Some(ErrorCode::InnerCommunication));
    }

    #[tokio::test]
    async fn test_memory_rejection_reports_rate_limited() {
        let bus = NodeBus::new("node-test");
        let proxies = ProxyManager::new(
            bus,
            Arc::new(NullObserver),
            false,
            Duration::from_millis(10),
        );
        // Zero-limit monitor rejects any sized message.
        struct FullProbe;
        impl MemoryProbe for FullProbe {
            fn current(&self) -> u64 {
                1_000_000
            }
            fn limit(&self) -> u64 {
                1_000_000
            }
        }
        let memory = Arc::new(MemoryMonitor::new(
            MemoryControlConfig::default(),
            Arc::new(FullProbe),
        ));
        let handler = InvocationHandler::new(proxies, memory, TokenBucket::new(10, 0.0));

        let response = handler
            .handle_invoke(InstanceId::new("caller".to_string()), invoke_msg("req-1"))
            .await;
        let MessageBody::InvokeRsp(rsp) = response.body else {
            panic!("expected invoke response");
        };
        assert_eq!(rsp.status.code, Some(ErrorCode::InvokeRateLimited));
        assert!(rsp.status.message.contains("memory"));
    }
}
