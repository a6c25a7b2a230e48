//! Per-instance proxy task and the node-wide proxy registry
//!
//! One proxy exists per instance name. It owns the self-dispatcher (calls to
//! the local copy of that instance) and a map of dispatchers for the other
//! instances it talks to, forwards cross-node traffic over the bus with
//! per-message-id reply promises, and retries call-result routing through
//! the data-plane observer before giving up with "instance not found".

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};

use super::call_cache::CallReply;
use super::dispatcher::{
    CallForwarder, CallResultSink, CallerInfo, Dispatcher, call_result_ack,
};
use super::perf::Perf;
use super::router_info::{DataPlaneObserver, InstanceRouterInfo};
use crate::bus::NodeBus;
use crate::domain_types::{EndpointAddress, InstanceId, MessageId, RequestId, TenantId};
use crate::error::{ErrorCode, Status};
use crate::messages::{Envelope, MessageBody, StreamingMessage};

const INSTANCE_EXIT_MESSAGE: &str = "instance has been killed or exited.";
/// Create-option key carrying a pre-resolved route to the callee's node.
const ROUTE_OPTION_KEY: &str = "ROUTE";
const MAX_CALL_RESULT_RETRY_TIMES: u32 = 3;
/// Deadline for a forwarded call or result to come back from the peer proxy.
const FORWARD_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// One instance's routing endpoint on this node.
pub struct InstanceProxy {
    instance_id: InstanceId,
    self_weak: Weak<InstanceProxy>,
    bus: Arc<NodeBus>,
    self_dispatcher: Dispatcher,
    remote_dispatchers: Mutex<HashMap<InstanceId, Dispatcher>>,
    forward_call_promises: StdMutex<HashMap<MessageId, oneshot::Sender<StreamingMessage>>>,
    forward_result_promises: StdMutex<HashMap<MessageId, oneshot::Sender<StreamingMessage>>>,
    observer: Arc<dyn DataPlaneObserver>,
    failed_result_subscribes: Mutex<HashMap<InstanceId, u32>>,
    perf: Arc<Perf>,
    manager: Weak<ProxyManager>,
    result_retry_defer: Duration,
}

impl InstanceProxy {
    /// Creates the proxy, registers its bus endpoint and starts consuming
    /// forward envelopes.
    pub fn spawn(
        instance_id: InstanceId,
        tenant_id: TenantId,
        bus: Arc<NodeBus>,
        observer: Arc<dyn DataPlaneObserver>,
        manager: Weak<ProxyManager>,
        perf: Arc<Perf>,
        result_retry_defer: Duration,
    ) -> Arc<Self> {
        let proxy = Arc::new_cyclic(|weak: &Weak<Self>| {
            let forwarder: Weak<dyn CallForwarder> = weak.clone();
            let sink: Weak<dyn CallResultSink> = {
                // The manager fans synthetic fatal results back into the
                // destination proxies.
                manager.clone()
            };
            Self {
                instance_id: instance_id.clone(),
                self_weak: weak.clone(),
                bus: Arc::clone(&bus),
                self_dispatcher: Dispatcher::new(
                    instance_id.clone(),
                    true,
                    tenant_id,
                    forwarder,
                    sink,
                    Arc::clone(&perf),
                ),
                remote_dispatchers: Mutex::new(HashMap::new()),
                forward_call_promises: StdMutex::new(HashMap::new()),
                forward_result_promises: StdMutex::new(HashMap::new()),
                observer,
                failed_result_subscribes: Mutex::new(HashMap::new()),
                perf,
                manager,
                result_retry_defer,
            }
        });
        let mut inbox = bus.register_endpoint(instance_id.as_ref());
        let receiving = Arc::clone(&proxy);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                receiving.handle_envelope(envelope).await;
            }
        });
        proxy
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub async fn tenant_id(&self) -> TenantId {
        self.self_dispatcher.tenant_id().await
    }

    fn own_address(&self) -> EndpointAddress {
        self.bus.address_of(self.instance_id.as_ref())
    }

    /// Submits a call heading for `dst_instance`, routing through the self
    /// dispatcher when it is this proxy's instance and through a remote
    /// dispatcher otherwise.
    pub async fn call(
        &self,
        caller: &CallerInfo,
        dst_instance: &InstanceId,
        request: StreamingMessage,
    ) -> CallReply {
        let (request_id, trace_id, route_option) = match &request.body {
            MessageBody::CallReq(call_req) => (
                call_req.request_id.clone(),
                call_req.trace_id.clone(),
                call_req.create_options.get(ROUTE_OPTION_KEY).cloned(),
            ),
            _ => (RequestId::new(String::new()), Default::default(), None),
        };
        info!(
            trace = %trace_id,
            request = %request_id,
            from = %caller.instance_id,
            to = %dst_instance,
            "received call request"
        );
        self.perf
            .record_received(&request_id, &trace_id, dst_instance, Instant::now());

        if *dst_instance == self.instance_id {
            return self.self_dispatcher.call(caller, request).await;
        }
        let dispatcher = {
            let mut dispatchers = self.remote_dispatchers.lock().await;
            if let Some(dispatcher) = dispatchers.get(dst_instance) {
                dispatcher.clone()
            } else {
                let dispatcher = self.new_remote_dispatcher(dst_instance);
                // A pre-resolved route lets the call go out before the
                // subscription delivers authoritative info.
                if let Some(url) = route_option.filter(|url| !url.is_empty()) {
                    let info = InstanceRouterInfo {
                        is_local: false,
                        is_ready: true,
                        is_low_reliability: true,
                        remote: Some(EndpointAddress::new(dst_instance.as_ref(), url)),
                        ..InstanceRouterInfo::default()
                    };
                    dispatcher.update_info(&info).await;
                }
                self.subscribe(dst_instance, false);
                dispatchers.insert(dst_instance.clone(), dispatcher.clone());
                dispatcher
            }
        };
        dispatcher.call(caller, request).await
    }

    /// Routes a terminal call result destined for `dst_instance` and returns
    /// the acknowledgement frame.
    pub async fn call_result(
        self: &Arc<Self>,
        src_instance: &InstanceId,
        dst_instance: &InstanceId,
        request: StreamingMessage,
    ) -> StreamingMessage {
        let request_id = match &request.body {
            MessageBody::CallResultReq(result) => result.request_id.clone(),
            _ => {
                return call_result_ack(
                    Status::error(ErrorCode::ParamInvalid, "expected a call result"),
                    &request.message_id,
                );
            }
        };
        self.perf.record_recv_result(&request_id);

        if *dst_instance == self.instance_id {
            let ack = self.self_dispatcher.call_result(request).await;
            self.apply_result_cleanup(&ack, &request_id, src_instance, dst_instance)
                .await;
            return ack;
        }

        let existing = self
            .remote_dispatchers
            .lock()
            .await
            .get(dst_instance)
            .cloned();
        let Some(dispatcher) = existing else {
            // Destination unknown (typically right after a proxy restart):
            // subscribe and retry before failing the caller.
            let dispatcher = self.new_remote_dispatcher(dst_instance);
            self.remote_dispatchers
                .lock()
                .await
                .insert(dst_instance.clone(), dispatcher);
            return self
                .retry_call_result(src_instance, dst_instance, request)
                .await;
        };
        let ack = dispatcher.call_result(request).await;
        self.self_dispatcher.on_call_result(&ack, &request_id).await;
        ack
    }

    async fn retry_call_result(
        self: &Arc<Self>,
        src_instance: &InstanceId,
        dst_instance: &InstanceId,
        request: StreamingMessage,
    ) -> StreamingMessage {
        loop {
            let _ = self
                .observer
                .subscribe_instance_event(&self.instance_id, dst_instance, false)
                .await;
            let informed = match self.remote_dispatchers.lock().await.get(dst_instance) {
                Some(dispatcher) => dispatcher.has_router_info().await,
                None => false,
            };
            if informed {
                self.failed_result_subscribes.lock().await.remove(dst_instance);
                return Box::pin(self.call_result(src_instance, dst_instance, request)).await;
            }
            let mut failed = self.failed_result_subscribes.lock().await;
            let attempts = failed.entry(dst_instance.clone()).or_insert(0);
            if *attempts >= MAX_CALL_RESULT_RETRY_TIMES {
                failed.remove(dst_instance);
                drop(failed);
                warn!(
                    dst = %dst_instance,
                    src = %src_instance,
                    "destination still unknown after retries, failing call result"
                );
                return call_result_ack(
                    Status::error(
                        ErrorCode::InstanceNotFound,
                        "instance not found or instance may not be recovered",
                    ),
                    &request.message_id,
                );
            }
            *attempts += 1;
            let attempt = *attempts;
            drop(failed);
            warn!(
                dst = %dst_instance,
                src = %src_instance,
                attempt,
                "destination route not subscribed yet, retrying call result"
            );
            tokio::time::sleep(self.result_retry_defer).await;
        }
    }

    /// Bucket cleanup after a call-result acknowledgement, mirrored onto
    /// every dispatcher that tracked the request; the source instance's
    /// proxy additionally releases the memory-admission charge.
    async fn apply_result_cleanup(
        self: &Arc<Self>,
        ack: &StreamingMessage,
        request_id: &RequestId,
        src_instance: &InstanceId,
        dst_instance: &InstanceId,
    ) {
        {
            let dispatchers = self.remote_dispatchers.lock().await;
            if let Some(dispatcher) = dispatchers.get(dst_instance) {
                dispatcher.on_call_result(ack, request_id).await;
            }
            if let Some(dispatcher) = dispatchers.get(src_instance) {
                dispatcher.on_call_result(ack, request_id).await;
            }
        }
        if *src_instance == self.instance_id {
            self.self_dispatcher.on_call_result(ack, request_id).await;
            if let Some(manager) = self.manager.upgrade() {
                manager.release_memory(src_instance, request_id);
            }
            self.perf.end_record(request_id);
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            if let Some(proxy) = manager.get(src_instance) {
                Box::pin(proxy.apply_result_cleanup(ack, request_id, src_instance, dst_instance))
                    .await;
            }
        }
    }

    fn new_remote_dispatcher(&self, instance_id: &InstanceId) -> Dispatcher {
        let forwarder: Weak<dyn CallForwarder> = self.self_weak.clone();
        let sink: Weak<dyn CallResultSink> = self.manager.clone();
        Dispatcher::new(
            instance_id.clone(),
            false,
            TenantId::default(),
            forwarder,
            sink,
            Arc::clone(&self.perf),
        )
    }

    fn subscribe(&self, target: &InstanceId, low_reliability: bool) {
        let observer = Arc::clone(&self.observer);
        let watcher = self.instance_id.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if observer
                .subscribe_instance_event(&watcher, &target, low_reliability)
                .await
                .is_err()
            {
                warn!(%watcher, %target, "instance event subscription failed");
            }
        });
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::ForwardCall {
                from,
                caller_tenant,
                message,
            } => self.on_forward_call(from, caller_tenant, message).await,
            Envelope::ResponseForwardCall { message } => {
                self.resolve_forward(&self.forward_call_promises, message, "forward call");
            }
            Envelope::ForwardCallResult { from, message } => {
                self.on_forward_call_result(from, message).await;
            }
            Envelope::ResponseForwardCallResult { message } => {
                self.resolve_forward(&self.forward_result_promises, message, "forward call result");
            }
            other => {
                warn!(instance = %self.instance_id, ?other, "unexpected envelope on proxy endpoint");
            }
        }
    }

    async fn on_forward_call(
        self: &Arc<Self>,
        from: EndpointAddress,
        caller_tenant: TenantId,
        message: StreamingMessage,
    ) {
        let src_instance = InstanceId::new(from.name.clone());
        let MessageBody::CallReq(call_req) = &message.body else {
            warn!(instance = %self.instance_id, "forward call without a call request body");
            return;
        };
        let request_id = call_req.request_id.clone();
        info!(
            trace = %call_req.trace_id,
            request = %request_id,
            from = %src_instance,
            to = %self.instance_id,
            function = %call_req.function,
            "received forwarded call"
        );
        self.perf.record_received(
            &request_id,
            &call_req.trace_id,
            &self.instance_id,
            Instant::now(),
        );
        let caller = CallerInfo {
            instance_id: src_instance.clone(),
            tenant_id: caller_tenant,
        };
        let reply = self.self_dispatcher.call(&caller, message).await;
        if src_instance != self.instance_id {
            // Track the sender so its death can fail our in-flight results
            // and results can be forwarded back.
            let dispatcher = {
                let mut dispatchers = self.remote_dispatchers.lock().await;
                match dispatchers.get(&src_instance) {
                    Some(dispatcher) => dispatcher.clone(),
                    None => {
                        let dispatcher = self.new_remote_dispatcher(&src_instance);
                        self.subscribe(&src_instance, true);
                        dispatchers.insert(src_instance.clone(), dispatcher.clone());
                        dispatcher
                    }
                }
            };
            dispatcher.update_remote_address(from.clone()).await;
        }
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            let mut response = reply.await;
            response.message_id = MessageId::new(request_id.to_string());
            info!(request = %request_id, "forwarding call response back");
            proxy
                .bus
                .send(&from, Envelope::ResponseForwardCall { message: response });
        });
    }

    async fn on_forward_call_result(self: &Arc<Self>, from: EndpointAddress, message: StreamingMessage) {
        let src_instance = InstanceId::new(from.name.clone());
        let MessageBody::CallResultReq(call_result) = &message.body else {
            warn!(instance = %self.instance_id, "forward call result without a result body");
            return;
        };
        let request_id = call_result.request_id.clone();
        let dst_instance = call_result.instance_id.clone();
        info!(request = %request_id, from = %src_instance, "received forwarded call result");
        self.perf.record_recv_result(&request_id);

        let mut ack = self.self_dispatcher.call_result(message).await;
        {
            let dispatchers = self.remote_dispatchers.lock().await;
            if let Some(dispatcher) = dispatchers.get(&src_instance) {
                dispatcher.on_call_result(&ack, &request_id).await;
            }
        }
        if dst_instance == self.instance_id {
            if let Some(manager) = self.manager.upgrade() {
                manager.release_memory(&src_instance, &request_id);
            }
        }
        self.perf.end_record(&request_id);
        ack.message_id = MessageId::new(request_id.to_string());
        info!(request = %request_id, "forwarding call result acknowledgement back");
        self.bus
            .send(&from, Envelope::ResponseForwardCallResult { message: ack });
    }

    fn resolve_forward(
        &self,
        promises: &StdMutex<HashMap<MessageId, oneshot::Sender<StreamingMessage>>>,
        message: StreamingMessage,
        what: &str,
    ) {
        let resolved = promises
            .lock()
            .expect("forward promises lock")
            .remove(&message.message_id);
        match resolved {
            Some(sender) => {
                let _ = sender.send(message);
            }
            None => warn!(
                message_id = %message.message_id,
                "no request waiting for {what} response, ignoring"
            ),
        }
    }

    /// Applies a subscription notification for `instance_id`.
    pub async fn notify_changed(&self, instance_id: &InstanceId, info: &InstanceRouterInfo) {
        if *instance_id == self.instance_id {
            self.self_dispatcher.update_info(info).await;
            return;
        }
        let mut dispatchers = self.remote_dispatchers.lock().await;
        let dispatcher = dispatchers
            .entry(instance_id.clone())
            .or_insert_with(|| self.new_remote_dispatcher(instance_id))
            .clone();
        drop(dispatchers);
        dispatcher.update_info(info).await;
    }

    /// Fails every outstanding request the named instance has with `code`.
    pub async fn fatal(&self, instance_id: &InstanceId, code: ErrorCode, message: &str) {
        if *instance_id == self.instance_id {
            self.self_dispatcher.fatal(code, message).await;
            return;
        }
        let dispatcher = self.remote_dispatchers.lock().await.get(instance_id).cloned();
        if let Some(dispatcher) = dispatcher {
            dispatcher.fatal(code, message).await;
        }
    }

    /// Marks the named instance as rejecting new work.
    pub async fn reject(&self, instance_id: &InstanceId, code: ErrorCode, message: &str) {
        if *instance_id == self.instance_id {
            self.self_dispatcher.reject(code, message).await;
            return;
        }
        let dispatcher = self.remote_dispatchers.lock().await.get(instance_id).cloned();
        if let Some(dispatcher) = dispatcher {
            dispatcher.reject(code, message).await;
        }
    }

    /// Drops the dispatcher for a departed peer, failing its requests.
    pub async fn delete_remote_dispatcher(&self, instance_id: &InstanceId) {
        let dispatcher = self.remote_dispatchers.lock().await.remove(instance_id);
        if let Some(dispatcher) = dispatcher {
            dispatcher
                .fatal(ErrorCode::InstanceExited, INSTANCE_EXIT_MESSAGE)
                .await;
        }
    }

    /// Tears the proxy down, failing everything still in flight.
    pub async fn delete(&self) {
        self.self_dispatcher
            .fatal(ErrorCode::InstanceExited, INSTANCE_EXIT_MESSAGE)
            .await;
        self.bus.unregister_endpoint(self.instance_id.as_ref());
    }

    /// Response futures of requests awaiting their call response.
    pub async fn on_resp_futures(&self) -> Vec<CallReply> {
        self.self_dispatcher.on_resp_futures().await
    }

    /// Outstanding request contexts across the self dispatcher's buckets.
    pub async fn outstanding(&self) -> usize {
        self.self_dispatcher.outstanding().await
    }
}

#[async_trait]
impl CallForwarder for InstanceProxy {
    async fn send_forward_call(
        &self,
        to: EndpointAddress,
        caller_tenant: TenantId,
        mut request: StreamingMessage,
    ) -> Result<StreamingMessage, ErrorCode> {
        let MessageBody::CallReq(call_req) = &request.body else {
            return Err(ErrorCode::ParamInvalid);
        };
        // Correlate by request id: the peer proxy echoes it back as the
        // response's message id.
        let message_id = MessageId::new(call_req.request_id.to_string());
        request.message_id = message_id.clone();
        let (tx, rx) = oneshot::channel();
        self.forward_call_promises
            .lock()
            .expect("forward promises lock")
            .insert(message_id.clone(), tx);
        info!(
            trace = %call_req.trace_id,
            request = %call_req.request_id,
            to = %to,
            "sending forward call"
        );
        self.bus.send(
            &to,
            Envelope::ForwardCall {
                from: self.own_address(),
                caller_tenant,
                message: request,
            },
        );
        match tokio::time::timeout(FORWARD_REPLY_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.forward_call_promises
                    .lock()
                    .expect("forward promises lock")
                    .remove(&message_id);
                Err(ErrorCode::RequestBetweenRuntimeBus)
            }
        }
    }

    async fn send_forward_call_result(
        &self,
        to: EndpointAddress,
        mut request: StreamingMessage,
    ) -> Result<StreamingMessage, ErrorCode> {
        let MessageBody::CallResultReq(call_result) = &request.body else {
            return Err(ErrorCode::ParamInvalid);
        };
        let message_id = MessageId::new(call_result.request_id.to_string());
        request.message_id = message_id.clone();
        let (tx, rx) = oneshot::channel();
        self.forward_result_promises
            .lock()
            .expect("forward promises lock")
            .insert(message_id.clone(), tx);
        info!(request = %call_result.request_id, to = %to, "sending forward call result");
        self.bus.send(
            &to,
            Envelope::ForwardCallResult {
                from: self.own_address(),
                message: request,
            },
        );
        match tokio::time::timeout(FORWARD_REPLY_TIMEOUT, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) | Err(_) => {
                self.forward_result_promises
                    .lock()
                    .expect("forward promises lock")
                    .remove(&message_id);
                Err(ErrorCode::RequestBetweenRuntimeBus)
            }
        }
    }
}

/// Type of the hook releasing memory-admission charges on completion.
pub type MemoryReleaseHook = Arc<dyn Fn(&InstanceId, &RequestId) + Send + Sync>;

/// Node-wide registry of instance proxies.
pub struct ProxyManager {
    bus: Arc<NodeBus>,
    observer: Arc<dyn DataPlaneObserver>,
    proxies: DashMap<InstanceId, Arc<InstanceProxy>>,
    perf: Arc<Perf>,
    result_retry_defer: Duration,
    memory_release: StdMutex<Option<MemoryReleaseHook>>,
}

impl ProxyManager {
    #[must_use]
    pub fn new(
        bus: Arc<NodeBus>,
        observer: Arc<dyn DataPlaneObserver>,
        perf_enabled: bool,
        result_retry_defer: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            observer,
            proxies: DashMap::new(),
            perf: Arc::new(Perf::new(perf_enabled)),
            result_retry_defer,
            memory_release: StdMutex::new(None),
        })
    }

    /// Installs the hook invoked when a tracked request reaches its
    /// terminal acknowledgement.
    pub fn set_memory_release(&self, hook: MemoryReleaseHook) {
        *self.memory_release.lock().expect("memory release lock") = Some(hook);
    }

    pub(crate) fn release_memory(&self, instance_id: &InstanceId, request_id: &RequestId) {
        let hook = self
            .memory_release
            .lock()
            .expect("memory release lock")
            .clone();
        if let Some(hook) = hook {
            hook(instance_id, request_id);
        }
    }

    #[must_use]
    pub fn get(&self, instance_id: &InstanceId) -> Option<Arc<InstanceProxy>> {
        self.proxies.get(instance_id).map(|entry| Arc::clone(&entry))
    }

    /// Returns the proxy for `instance_id`, creating and spawning it on
    /// first use.
    pub fn get_or_create(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        tenant_id: TenantId,
    ) -> Arc<InstanceProxy> {
        if let Some(existing) = self.get(instance_id) {
            return existing;
        }
        let proxy = InstanceProxy::spawn(
            instance_id.clone(),
            tenant_id,
            Arc::clone(&self.bus),
            Arc::clone(&self.observer),
            Arc::downgrade(self),
            Arc::clone(&self.perf),
            self.result_retry_defer,
        );
        self.proxies.insert(instance_id.clone(), Arc::clone(&proxy));
        proxy
    }

    /// Removes and tears down the proxy for a deleted instance.
    pub async fn remove(&self, instance_id: &InstanceId) {
        if let Some((_, proxy)) = self.proxies.remove(instance_id) {
            proxy.delete().await;
        }
    }

    /// Fans a routing notification to the owning proxy.
    pub async fn notify_changed(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        info: &InstanceRouterInfo,
    ) {
        let proxy = self.get_or_create(instance_id, info.tenant_id.clone());
        proxy.notify_changed(instance_id, info).await;
    }

    /// Marks an instance fatal on every proxy tracking it.
    pub async fn fatal(&self, instance_id: &InstanceId, code: ErrorCode, message: &str) {
        let proxies: Vec<Arc<InstanceProxy>> = self
            .proxies
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for proxy in proxies {
            proxy.fatal(instance_id, code, message).await;
        }
    }
}

impl CallResultSink for ProxyManager {
    fn deliver(
        &self,
        from_instance: InstanceId,
        dst_instance: InstanceId,
        result: StreamingMessage,
    ) {
        let Some(proxy) = self.get(&dst_instance) else {
            warn!(
                %dst_instance,
                "no proxy for synthetic call result destination, dropping"
            );
            return;
        };
        tokio::spawn(async move {
            let ack = proxy
                .call_result(&from_instance, &dst_instance, result)
                .await;
            if let MessageBody::CallResultAck(ack) = &ack.body {
                if ack.status.is_err() {
                    warn!(
                        %dst_instance,
                        status = %ack.status,
                        "synthetic call result was not acknowledged"
                    );
                }
            }
        });
    }
}
