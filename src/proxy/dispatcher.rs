//! Per-instance request dispatcher
//!
//! Holds the three request buckets and the instance's routing flags. A call
//! to a ready local instance goes out on the runtime's data interface; a
//! ready remote instance gets a forward envelope to its owning proxy; an
//! unready instance parks the context in `new` until a readiness flip drains
//! it. Fatal and reject states short-circuit everything with the recorded
//! code.

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::call_cache::{CallCache, CallReply, CallRequestContext, ResponsePromise, call_response};
use super::perf::Perf;
use super::router_info::{InstanceRouterInfo, RuntimeClient};
use crate::domain_types::{
    EndpointAddress, InstanceId, MessageId, ProxyId, RequestId, RuntimeId, TenantId,
};
use crate::error::{ErrorCode, Status};
use crate::messages::{
    CallResult, CallResultAck, MessageBody, NotifyRequest, StreamingMessage,
};

/// Identity of the caller submitting a request.
#[derive(Debug, Clone, Default)]
pub struct CallerInfo {
    pub instance_id: InstanceId,
    pub tenant_id: TenantId,
}

/// Cross-proxy forwarding seam, implemented by the owning instance proxy.
#[async_trait]
pub trait CallForwarder: Send + Sync {
    async fn send_forward_call(
        &self,
        to: EndpointAddress,
        caller_tenant: TenantId,
        request: StreamingMessage,
    ) -> Result<StreamingMessage, ErrorCode>;

    async fn send_forward_call_result(
        &self,
        to: EndpointAddress,
        request: StreamingMessage,
    ) -> Result<StreamingMessage, ErrorCode>;
}

/// Fan-out target for the synthetic call results emitted on fatal.
pub trait CallResultSink: Send + Sync {
    /// Delivers `result` toward `dst_instance` on behalf of `from_instance`.
    fn deliver(&self, from_instance: InstanceId, dst_instance: InstanceId, result: StreamingMessage);
}

/// Builds a `CallResultAck` frame under `message_id`.
#[must_use]
pub fn call_result_ack(status: Status, message_id: &MessageId) -> StreamingMessage {
    StreamingMessage::new(
        message_id.clone(),
        MessageBody::CallResultAck(CallResultAck { status }),
    )
}

fn ready_reply(response: StreamingMessage) -> CallReply {
    futures::future::ready(response).boxed().shared()
}

struct DispatcherState {
    cache: CallCache,
    is_local: bool,
    is_ready: bool,
    is_fatal: bool,
    is_reject: bool,
    is_low_reliability: bool,
    fatal_code: Option<ErrorCode>,
    fatal_message: String,
    runtime_id: Option<RuntimeId>,
    proxy_id: Option<ProxyId>,
    remote: Option<EndpointAddress>,
    tenant_id: TenantId,
    function: String,
    client: Option<Arc<dyn RuntimeClient>>,
    info_applied: bool,
    call_times: u64,
    failed_call_times: u64,
}

enum TriggerJob {
    Local {
        client: Arc<dyn RuntimeClient>,
        request: StreamingMessage,
        request_id: RequestId,
    },
    Remote {
        to: EndpointAddress,
        caller_tenant: TenantId,
        request: StreamingMessage,
        request_id: RequestId,
    },
}

/// Cloneable handle to one instance's dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

struct DispatcherShared {
    instance_id: InstanceId,
    perf: Arc<Perf>,
    forwarder: Weak<dyn CallForwarder>,
    result_sink: Weak<dyn CallResultSink>,
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    pub fn new(
        instance_id: InstanceId,
        is_local: bool,
        tenant_id: TenantId,
        forwarder: Weak<dyn CallForwarder>,
        result_sink: Weak<dyn CallResultSink>,
        perf: Arc<Perf>,
    ) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                instance_id,
                perf,
                forwarder,
                result_sink,
                state: Mutex::new(DispatcherState {
                    cache: CallCache::new(),
                    is_local,
                    is_ready: false,
                    is_fatal: false,
                    is_reject: false,
                    is_low_reliability: false,
                    fatal_code: None,
                    fatal_message: String::new(),
                    runtime_id: None,
                    proxy_id: None,
                    remote: None,
                    tenant_id,
                    function: String::new(),
                    client: None,
                    info_applied: false,
                    call_times: 0,
                    failed_call_times: 0,
                }),
            }),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.shared.instance_id
    }

    pub async fn tenant_id(&self) -> TenantId {
        self.shared.state.lock().await.tenant_id.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.shared.state.lock().await.is_ready
    }

    /// Whether a subscription notification has been applied yet.
    pub async fn has_router_info(&self) -> bool {
        self.shared.state.lock().await.info_applied
    }

    /// Submits a call. Duplicate request ids return the existing future; an
    /// unready instance parks the request until readiness flips.
    pub async fn call(&self, caller: &CallerInfo, request: StreamingMessage) -> CallReply {
        let MessageBody::CallReq(call_req) = &request.body else {
            return ready_reply(call_response(
                Status::error(ErrorCode::ParamInvalid, "expected a call request"),
                &request.message_id,
            ));
        };
        let request_id = call_req.request_id.clone();
        let mut state = self.shared.state.lock().await;
        if state.is_fatal {
            error!(
                trace = %call_req.trace_id,
                request = %request_id,
                instance = %self.shared.instance_id,
                "instance is fatal, failed to call"
            );
            let cause = if state.fatal_message.is_empty() {
                "unknown reason"
            } else {
                &state.fatal_message
            };
            let code = state
                .fatal_code
                .unwrap_or(ErrorCode::InstanceExited)
                .coerce_fatal();
            return ready_reply(call_response(
                Status::error(code, format!("instance occurs fatal error, cause by: ({cause})")),
                &request.message_id,
            ));
        }
        if state.is_reject {
            error!(
                trace = %call_req.trace_id,
                request = %request_id,
                instance = %self.shared.instance_id,
                "instance is rejecting requests"
            );
            let code = state.fatal_code.unwrap_or(ErrorCode::InstanceExited);
            let message = state.fatal_message.clone();
            return ready_reply(call_response(
                Status::error(code, message),
                &request.message_id,
            ));
        }
        if let Some(existing) = state.cache.find(&request_id) {
            // A resubmit before readiness stays parked; one after readiness
            // re-triggers the send for the same context.
            let reply = existing.response.future();
            if state.is_ready {
                let job = self.prepare_trigger(&mut state, &request_id);
                drop(state);
                self.spawn_trigger(job);
            } else {
                info!(
                    request = %request_id,
                    "call request already parked, instance not ready yet"
                );
            }
            return reply;
        }
        let context = Arc::new(CallRequestContext {
            from: call_req.sender_id.clone(),
            request_id: request_id.clone(),
            trace_id: call_req.trace_id.clone(),
            caller_tenant_id: caller.tenant_id.clone(),
            request: request.clone(),
            response: ResponsePromise::new(),
        });
        let reply = context.response.future();
        state.cache.push(context);
        if state.is_ready {
            let job = self.prepare_trigger(&mut state, &request_id);
            drop(state);
            self.spawn_trigger(job);
        }
        reply
    }

    fn prepare_trigger(
        &self,
        state: &mut DispatcherState,
        request_id: &RequestId,
    ) -> Option<TriggerJob> {
        let Some(context) = state.cache.find(request_id) else {
            error!(request = %request_id, "call request context is gone");
            return None;
        };
        if state.is_local {
            let Some(client) = state.client.clone() else {
                warn!(
                    instance = %self.shared.instance_id,
                    "local instance has no data-interface client yet"
                );
                return None;
            };
            state.call_times += 1;
            state.cache.move_to_on_resp(request_id);
            self.shared.perf.record_send_call(request_id);
            info!(
                trace = %context.trace_id,
                request = %request_id,
                instance = %self.shared.instance_id,
                runtime = state.runtime_id.as_ref().map_or("", RuntimeId::as_str),
                "send call to local runtime"
            );
            return Some(TriggerJob::Local {
                client,
                request: context.request.clone(),
                request_id: request_id.clone(),
            });
        }
        let Some(to) = state.remote.clone() else {
            warn!(
                instance = %self.shared.instance_id,
                "remote instance has no forwarding address yet"
            );
            return None;
        };
        state.cache.move_to_on_resp(request_id);
        self.shared.perf.record_send_call(request_id);
        info!(
            trace = %context.trace_id,
            request = %request_id,
            instance = %self.shared.instance_id,
            proxy = state.proxy_id.as_ref().map_or("", ProxyId::as_str),
            "forward call to remote proxy"
        );
        Some(TriggerJob::Remote {
            to,
            caller_tenant: context.caller_tenant_id.clone(),
            request: context.request.clone(),
            request_id: request_id.clone(),
        })
    }

    fn spawn_trigger(&self, job: Option<TriggerJob>) {
        let Some(job) = job else { return };
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match job {
                TriggerJob::Local {
                    client,
                    request,
                    request_id,
                } => {
                    let message_id = request.message_id.clone();
                    let result = client.call(request).await;
                    dispatcher.finish_call(&request_id, &message_id, result).await;
                }
                TriggerJob::Remote {
                    to,
                    caller_tenant,
                    request,
                    request_id,
                } => {
                    let message_id = request.message_id.clone();
                    let result = match dispatcher.shared.forwarder.upgrade() {
                        Some(forwarder) => {
                            forwarder
                                .send_forward_call(to, caller_tenant, request)
                                .await
                        }
                        None => Err(ErrorCode::InnerCommunication),
                    };
                    dispatcher.finish_call(&request_id, &message_id, result).await;
                }
            }
        });
    }

    /// Completes the context's promise with the call response (or a
    /// synthesized retryable failure) and applies the bucket transition.
    async fn finish_call(
        &self,
        request_id: &RequestId,
        message_id: &MessageId,
        result: Result<StreamingMessage, ErrorCode>,
    ) {
        let response = match result {
            Ok(mut response) => {
                response.message_id = message_id.clone();
                response
            }
            Err(_) => call_response(
                Status::error(
                    ErrorCode::RequestBetweenRuntimeBus,
                    "connection with runtime may be interrupted, please retry.",
                ),
                message_id,
            ),
        };
        self.shared.perf.record_recv_rsp(request_id);
        let context = {
            let state = self.shared.state.lock().await;
            state.cache.find(request_id)
        };
        self.on_call(&response, request_id).await;
        if let Some(context) = context {
            context.response.complete(response);
        }
    }

    /// Bucket transition for a received call response: OK moves the request
    /// to `in_progress`, an error removes it.
    pub async fn on_call(&self, response: &StreamingMessage, request_id: &RequestId) {
        let ok = matches!(&response.body, MessageBody::CallRsp(rsp) if rsp.status.is_ok());
        let mut state = self.shared.state.lock().await;
        if ok {
            state.cache.move_to_in_progress(request_id);
        } else {
            if state.is_local {
                state.failed_call_times += 1;
            }
            state.cache.delete_on_resp(request_id);
            state.cache.delete_new(request_id);
        }
    }

    /// Routes a terminal call result toward this dispatcher's instance and
    /// returns the acknowledgement. Bucket cleanup happens separately in
    /// [`Self::on_call_result`], driven by the owning proxy.
    pub async fn call_result(&self, request: StreamingMessage) -> StreamingMessage {
        let MessageBody::CallResultReq(call_result) = &request.body else {
            return call_result_ack(
                Status::error(ErrorCode::ParamInvalid, "expected a call result"),
                &request.message_id,
            );
        };
        let request_id = call_result.request_id.clone();
        let state = self.shared.state.lock().await;
        if state.is_fatal {
            error!(
                instance = %self.shared.instance_id,
                "failed to send call result, target instance is fatal"
            );
            let code = state.fatal_code.unwrap_or(ErrorCode::InstanceExited);
            let message = state.fatal_message.clone();
            return call_result_ack(Status::error(code, message), &request.message_id);
        }
        if !state.is_local {
            let Some(to) = state.remote.clone() else {
                return call_result_ack(
                    Status::error(ErrorCode::InnerCommunication, "no route to instance"),
                    &request.message_id,
                );
            };
            drop(state);
            info!(
                request = %request_id,
                instance = %self.shared.instance_id,
                "forward call result to remote proxy"
            );
            self.shared.perf.record_send_result(&request_id);
            let message_id = request.message_id.clone();
            return match self.shared.forwarder.upgrade() {
                Some(forwarder) => match forwarder.send_forward_call_result(to, request).await {
                    Ok(ack) => ack,
                    Err(code) => call_result_ack(
                        Status::error(code, "forwarding call result failed"),
                        &message_id,
                    ),
                },
                None => call_result_ack(
                    Status::error(ErrorCode::InnerCommunication, "no route to instance"),
                    &message_id,
                ),
            };
        }
        let Some(client) = state.client.clone() else {
            return call_result_ack(
                Status::error(ErrorCode::RequestBetweenRuntimeBus, "no route to instance"),
                &request.message_id,
            );
        };
        drop(state);
        info!(
            request = %request_id,
            instance = %self.shared.instance_id,
            "send call result to local runtime"
        );
        self.shared.perf.record_send_result(&request_id);
        let notify = NotifyRequest {
            request_id: request_id.clone(),
            status: call_result.status.clone(),
            payload: call_result.payload.clone(),
        };
        match client.notify_result(notify).await {
            Ok(_) => call_result_ack(Status::ok(), &request.message_id),
            Err(_) => call_result_ack(
                Status::error(
                    ErrorCode::RequestBetweenRuntimeBus,
                    "connection with runtime may be interrupted, please retry.",
                ),
                &request.message_id,
            ),
        }
    }

    /// Bucket cleanup after the call-result acknowledgement: an OK ack
    /// removes the request from `in_progress`.
    pub async fn on_call_result(&self, ack: &StreamingMessage, request_id: &RequestId) {
        self.shared.perf.record_recv_ack(request_id);
        let ok = matches!(&ack.body, MessageBody::CallResultAck(ack) if ack.status.is_ok());
        let mut state = self.shared.state.lock().await;
        if !ok {
            if state.is_local {
                state.failed_call_times += 1;
            }
            return;
        }
        state.cache.delete_in_progress(request_id);
    }

    /// Applies a subscription notification. A flip to ready drains the
    /// parked requests in submission order exactly once; low-reliability
    /// instances observed ready remotely ignore a later downgrade.
    pub async fn update_info(&self, info: &InstanceRouterInfo) {
        let mut state = self.shared.state.lock().await;
        state.info_applied = true;
        state.is_local = info.is_local;
        if let Some(client) = info.local_client.clone() {
            state.client = Some(client);
        }
        let mut is_ready = info.is_ready;
        if info.is_local && state.client.is_none() {
            is_ready = false;
        }
        state.proxy_id = info.proxy_id.clone();
        state.remote = info.remote.clone();
        state.is_fatal = false;
        state.is_reject = false;
        state.runtime_id = info.runtime_id.clone();
        state.tenant_id = info.tenant_id.clone();
        state.function = info.function.clone();
        state.is_low_reliability = info.is_low_reliability;
        if state.is_low_reliability && !state.is_local && state.is_ready {
            // Subscribed events may arrive late for low-reliability remote
            // instances; an unready downgrade is ignored.
            return;
        }
        if state.is_ready == is_ready {
            return;
        }
        state.is_ready = is_ready;
        if !state.is_ready {
            return;
        }
        state.cache.move_all_to_new();
        let waiting = state.cache.new_requests();
        let jobs: Vec<Option<TriggerJob>> = waiting
            .iter()
            .map(|request_id| self.prepare_trigger(&mut state, request_id))
            .collect();
        drop(state);
        for job in jobs {
            self.spawn_trigger(job);
        }
    }

    /// Updates only the remote forwarding address, preserving readiness.
    pub async fn update_remote_address(&self, remote: EndpointAddress) {
        let mut state = self.shared.state.lock().await;
        state.remote = Some(remote);
    }

    /// Marks the instance dead: every context in every bucket completes
    /// with the fatal status; requests already sent additionally notify the
    /// original caller with a synthetic call result so it does not hang.
    pub async fn fatal(&self, code: ErrorCode, message: &str) {
        let mut state = self.shared.state.lock().await;
        state.fatal_message = message.to_string();
        state.fatal_code = Some(code);
        state.is_fatal = true;

        info!(
            instance = %self.shared.instance_id,
            function = %state.function,
            "responding to all parked and in-flight requests"
        );
        let fatal_status = Status::error(code.coerce_fatal(), message);

        for request_id in state.cache.new_requests() {
            if let Some(context) = state.cache.find(&request_id) {
                context.response.complete(call_response(
                    fatal_status.clone(),
                    &context.request.message_id,
                ));
            }
            state.cache.delete_new(&request_id);
        }
        let mut notify: Vec<Arc<CallRequestContext>> = Vec::new();
        for request_id in state.cache.on_resp_requests() {
            if let Some(context) = state.cache.find(&request_id) {
                context.response.complete(call_response(
                    fatal_status.clone(),
                    &context.request.message_id,
                ));
                notify.push(context);
            }
            state.cache.delete_on_resp(&request_id);
        }
        for request_id in state.cache.in_progress_requests() {
            if let Some(context) = state.cache.find(&request_id) {
                notify.push(context);
            }
            state.cache.delete_in_progress(&request_id);
        }
        drop(state);

        if let Some(sink) = self.shared.result_sink.upgrade() {
            for context in notify {
                let result = StreamingMessage::new(
                    MessageId::new(context.request_id.to_string()),
                    MessageBody::CallResultReq(CallResult {
                        instance_id: context.from.clone(),
                        request_id: context.request_id.clone(),
                        status: fatal_status.clone(),
                        payload: vec![],
                        small_objects: vec![],
                    }),
                );
                sink.deliver(
                    self.shared.instance_id.clone(),
                    context.from.clone(),
                    result,
                );
            }
        }
    }

    /// Marks the instance as rejecting new work with the given status.
    pub async fn reject(&self, code: ErrorCode, message: &str) {
        let mut state = self.shared.state.lock().await;
        state.fatal_message = message.to_string();
        state.fatal_code = Some(code);
        state.is_reject = true;
    }

    /// Response futures of requests awaiting their call response.
    pub async fn on_resp_futures(&self) -> Vec<CallReply> {
        self.shared.state.lock().await.cache.on_resp_futures()
    }

    /// `(total, failed)` call counters for this dispatcher.
    pub async fn call_counters(&self) -> (u64, u64) {
        let state = self.shared.state.lock().await;
        (state.call_times, state.failed_call_times)
    }

    pub async fn outstanding(&self) -> usize {
        self.shared.state.lock().await.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CallRequest, CallResponse, NotifyResponse};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingClient {
        calls: StdMutex<Vec<RequestId>>,
    }

    impl RecordingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<RequestId> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl RuntimeClient for RecordingClient {
        async fn call(&self, request: StreamingMessage) -> Result<StreamingMessage, ErrorCode> {
            let MessageBody::CallReq(call_req) = &request.body else {
                return Err(ErrorCode::ParamInvalid);
            };
            self.calls
                .lock()
                .expect("calls lock")
                .push(call_req.request_id.clone());
            Ok(StreamingMessage::new(
                request.message_id.clone(),
                MessageBody::CallRsp(CallResponse { status: Status::ok() }),
            ))
        }

        async fn notify_result(
            &self,
            _request: NotifyRequest,
        ) -> Result<NotifyResponse, ErrorCode> {
            Ok(NotifyResponse { status: Status::ok() })
        }
    }

    struct NullForwarder;

    #[async_trait]
    impl CallForwarder for NullForwarder {
        async fn send_forward_call(
            &self,
            _to: EndpointAddress,
            _caller_tenant: TenantId,
            _request: StreamingMessage,
        ) -> Result<StreamingMessage, ErrorCode> {
            Err(ErrorCode::InnerCommunication)
        }

        async fn send_forward_call_result(
            &self,
            _to: EndpointAddress,
            _request: StreamingMessage,
        ) -> Result<StreamingMessage, ErrorCode> {
            Err(ErrorCode::InnerCommunication)
        }
    }

    struct CollectingSink {
        delivered: StdMutex<Vec<(InstanceId, RequestId)>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
            })
        }
    }

    impl CallResultSink for CollectingSink {
        fn deliver(
            &self,
            _from_instance: InstanceId,
            dst_instance: InstanceId,
            result: StreamingMessage,
        ) {
            let MessageBody::CallResultReq(call_result) = &result.body else {
                return;
            };
            self.delivered
                .lock()
                .expect("delivered lock")
                .push((dst_instance, call_result.request_id.clone()));
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        client: Arc<RecordingClient>,
        sink: Arc<CollectingSink>,
        // Keeps the forwarder allocation alive so the dispatcher's weak
        // handle stays upgradeable for the test's lifetime.
        _forwarder: Arc<NullForwarder>,
    }

    fn fixture() -> Fixture {
        let forwarder: Arc<NullForwarder> = Arc::new(NullForwarder);
        let sink = CollectingSink::new();
        let client = RecordingClient::new();
        let forwarder_dyn: Arc<dyn CallForwarder> = forwarder.clone();
        let sink_dyn: Arc<dyn CallResultSink> = sink.clone();
        let dispatcher = Dispatcher::new(
            InstanceId::new("instA".to_string()),
            true,
            TenantId::default(),
            Arc::downgrade(&forwarder_dyn),
            Arc::downgrade(&sink_dyn),
            Arc::new(Perf::new(false)),
        );
        Fixture {
            dispatcher,
            client,
            sink,
            _forwarder: forwarder,
        }
    }

    fn call_msg(request_id: &str) -> StreamingMessage {
        StreamingMessage::request(MessageBody::CallReq(CallRequest {
            function: "echo".to_string(),
            request_id: RequestId::new(request_id.to_string()),
            trace_id: crate::domain_types::TraceId::default(),
            sender_id: InstanceId::new("caller".to_string()),
            args: vec![],
            return_object_ids: vec![],
            create_options: HashMap::new(),
        }))
    }

    fn ready_info(client: Arc<dyn RuntimeClient>) -> InstanceRouterInfo {
        InstanceRouterInfo {
            is_local: true,
            is_ready: true,
            runtime_id: Some(RuntimeId::new("rt-1".to_string())),
            local_client: Some(client),
            ..InstanceRouterInfo::default()
        }
    }

    #[tokio::test]
    async fn test_ready_flip_drains_parked_requests_in_order() {
        let fx = fixture();
        let caller = CallerInfo::default();

        let replies: Vec<CallReply> = {
            let mut replies = Vec::new();
            for id in ["req-1", "req-2", "req-3"] {
                replies.push(fx.dispatcher.call(&caller, call_msg(id)).await);
            }
            replies
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.client.sent().is_empty(), "no frames before readiness");

        fx.dispatcher.update_info(&ready_info(fx.client.clone())).await;
        for reply in replies {
            let response = reply.await;
            assert!(matches!(
                response.body,
                MessageBody::CallRsp(ref rsp) if rsp.status.is_ok()
            ));
        }
        let sent: Vec<String> = fx
            .client
            .sent()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(sent, ["req-1", "req-2", "req-3"]);
    }

    #[tokio::test]
    async fn test_redundant_ready_notification_is_a_noop() {
        let fx = fixture();
        let caller = CallerInfo::default();
        fx.dispatcher.update_info(&ready_info(fx.client.clone())).await;

        let reply = fx.dispatcher.call(&caller, call_msg("req-1")).await;
        reply.await;
        assert_eq!(fx.client.sent().len(), 1);

        // Already ready: the notification must not re-trigger the request
        // still sitting in in_progress.
        fx.dispatcher.update_info(&ready_info(fx.client.clone())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.client.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_submit_shares_future() {
        let fx = fixture();
        let caller = CallerInfo::default();

        let first = fx.dispatcher.call(&caller, call_msg("req-1")).await;
        let second = fx.dispatcher.call(&caller, call_msg("req-1")).await;
        assert_eq!(fx.dispatcher.outstanding().await, 1);

        fx.dispatcher.update_info(&ready_info(fx.client.clone())).await;
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, b);
        assert_eq!(fx.client.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_fails_every_bucket_and_notifies_callers() {
        let fx = fixture();
        let caller = CallerInfo::default();

        // req-1 parked in new; req-2 sent and in progress.
        let parked = fx.dispatcher.call(&caller, call_msg("req-1")).await;
        fx.dispatcher.update_info(&ready_info(fx.client.clone())).await;
        let sent = fx.dispatcher.call(&caller, call_msg("req-2")).await;
        sent.await;
        parked.await;

        // Park one more while unready again.
        let unready = InstanceRouterInfo {
            is_local: true,
            is_ready: false,
            local_client: Some(fx.client.clone()),
            ..InstanceRouterInfo::default()
        };
        fx.dispatcher.update_info(&unready).await;
        let late = fx.dispatcher.call(&caller, call_msg("req-3")).await;

        fx.dispatcher
            .fatal(ErrorCode::RequestBetweenRuntimeBus, "runtime exited")
            .await;

        // Retryable fatal codes are coerced so callers re-create instead of
        // retrying against a dead runtime.
        let response = late.await;
        let MessageBody::CallRsp(rsp) = response.body else {
            panic!("expected call response");
        };
        assert_eq!(rsp.status.code, Some(ErrorCode::InstanceExited));
        assert_eq!(fx.dispatcher.outstanding().await, 0);

        // req-2 was in progress: its caller got a synthetic call result.
        let delivered = fx.sink.delivered.lock().expect("delivered lock").clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.as_ref(), "req-2");

        // Later calls fail immediately with the coerced fatal code.
        let after = fx.dispatcher.call(&caller, call_msg("req-9")).await.await;
        let MessageBody::CallRsp(rsp) = after.body else {
            panic!("expected call response");
        };
        assert_eq!(rsp.status.code, Some(ErrorCode::InstanceExited));
    }

    #[tokio::test]
    async fn test_reject_returns_recorded_status() {
        let fx = fixture();
        fx.dispatcher
            .reject(ErrorCode::InvokeRateLimited, "draining")
            .await;

        let response = fx
            .dispatcher
            .call(&CallerInfo::default(), call_msg("req-1"))
            .await
            .await;
        let MessageBody::CallRsp(rsp) = response.body else {
            panic!("expected call response");
        };
        assert_eq!(rsp.status.code, Some(ErrorCode::InvokeRateLimited));
        assert_eq!(rsp.status.message, "draining");
    }

    #[tokio::test]
    async fn test_low_reliability_ignores_remote_downgrade() {
        let fx = fixture();
        let remote_ready = InstanceRouterInfo {
            is_local: false,
            is_ready: true,
            is_low_reliability: true,
            remote: Some(EndpointAddress::new("peer-proxy", "node-b")),
            ..InstanceRouterInfo::default()
        };
        fx.dispatcher.update_info(&remote_ready).await;
        assert!(fx.dispatcher.is_ready().await);

        let downgrade = InstanceRouterInfo {
            is_local: false,
            is_ready: false,
            is_low_reliability: true,
            remote: Some(EndpointAddress::new("peer-proxy", "node-b")),
            ..InstanceRouterInfo::default()
        };
        fx.dispatcher.update_info(&downgrade).await;
        assert!(fx.dispatcher.is_ready().await, "stale downgrade must be ignored");
    }
}
