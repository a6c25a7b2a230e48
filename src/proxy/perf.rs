//! Optional per-request timing checkpoints
//!
//! Seven checkpoints trace a call through the proxy: client arrival, proxy
//! entry, call send, call-response receipt, result receipt, result send and
//! ack receipt. One structured log line is emitted when the request
//! completes, then the context is dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

use crate::domain_types::{InstanceId, RequestId, TraceId};

#[derive(Debug, Clone, Default)]
struct PerfContext {
    trace_id: TraceId,
    dst_instance: Option<InstanceId>,
    received: Option<Instant>,
    proxy_in: Option<Instant>,
    send_call: Option<Instant>,
    recv_rsp: Option<Instant>,
    recv_result: Option<Instant>,
    send_result: Option<Instant>,
    recv_ack: Option<Instant>,
}

fn micros_between(from: Option<Instant>, to: Option<Instant>) -> i64 {
    match (from, to) {
        (Some(from), Some(to)) => i64::try_from(to.duration_since(from).as_micros()).unwrap_or(-1),
        _ => -1,
    }
}

/// Checkpoint recorder; a no-op when disabled.
pub struct Perf {
    enabled: bool,
    contexts: Mutex<HashMap<RequestId, PerfContext>>,
}

impl Perf {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Opens the context at client arrival.
    pub fn record_received(
        &self,
        request_id: &RequestId,
        trace_id: &TraceId,
        dst_instance: &InstanceId,
        received: Instant,
    ) {
        if !self.enabled {
            return;
        }
        let mut contexts = self.contexts.lock().expect("perf lock");
        let ctx = contexts.entry(request_id.clone()).or_default();
        ctx.trace_id = trace_id.clone();
        ctx.dst_instance = Some(dst_instance.clone());
        ctx.received = Some(received);
        ctx.proxy_in = Some(Instant::now());
    }

    pub fn record_send_call(&self, request_id: &RequestId) {
        self.stamp(request_id, |ctx| ctx.send_call = Some(Instant::now()));
    }

    pub fn record_recv_rsp(&self, request_id: &RequestId) {
        self.stamp(request_id, |ctx| ctx.recv_rsp = Some(Instant::now()));
    }

    pub fn record_recv_result(&self, request_id: &RequestId) {
        self.stamp(request_id, |ctx| ctx.recv_result = Some(Instant::now()));
    }

    pub fn record_send_result(&self, request_id: &RequestId) {
        self.stamp(request_id, |ctx| ctx.send_result = Some(Instant::now()));
    }

    pub fn record_recv_ack(&self, request_id: &RequestId) {
        self.stamp(request_id, |ctx| ctx.recv_ack = Some(Instant::now()));
    }

    fn stamp(&self, request_id: &RequestId, apply: impl FnOnce(&mut PerfContext)) {
        if !self.enabled {
            return;
        }
        let mut contexts = self.contexts.lock().expect("perf lock");
        if let Some(ctx) = contexts.get_mut(request_id) {
            apply(ctx);
        }
    }

    /// Emits the timing line and drops the context.
    pub fn end_record(&self, request_id: &RequestId) {
        if !self.enabled {
            return;
        }
        let Some(ctx) = self
            .contexts
            .lock()
            .expect("perf lock")
            .remove(request_id)
        else {
            return;
        };
        info!(
            request = %request_id,
            trace = %ctx.trace_id,
            instance = ctx.dst_instance.as_ref().map_or("", InstanceId::as_str),
            proxy_in_us = micros_between(ctx.received, ctx.proxy_in),
            send_call_us = micros_between(ctx.proxy_in, ctx.send_call),
            recv_rsp_us = micros_between(ctx.send_call, ctx.recv_rsp),
            recv_result_us = micros_between(ctx.recv_rsp, ctx.recv_result),
            send_result_us = micros_between(ctx.recv_result, ctx.send_result),
            recv_ack_us = micros_between(ctx.send_result, ctx.recv_ack),
            total_us = micros_between(ctx.received, ctx.recv_ack),
            "call perf"
        );
    }

    /// Number of open contexts; zero once all requests completed.
    #[must_use]
    pub fn open_contexts(&self) -> usize {
        self.contexts.lock().expect("perf lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestId {
        RequestId::new("req-1".to_string())
    }

    #[test]
    fn test_disabled_perf_records_nothing() {
        let perf = Perf::new(false);
        perf.record_received(
            &request(),
            &TraceId::default(),
            &InstanceId::new("instA".to_string()),
            Instant::now(),
        );
        assert_eq!(perf.open_contexts(), 0);
    }

    #[test]
    fn test_full_checkpoint_cycle_drains_context() {
        let perf = Perf::new(true);
        let req = request();
        perf.record_received(
            &req,
            &TraceId::default(),
            &InstanceId::new("instA".to_string()),
            Instant::now(),
        );
        perf.record_send_call(&req);
        perf.record_recv_rsp(&req);
        perf.record_recv_result(&req);
        perf.record_send_result(&req);
        perf.record_recv_ack(&req);
        assert_eq!(perf.open_contexts(), 1);

        perf.end_record(&req);
        assert_eq!(perf.open_contexts(), 0);
    }

    #[test]
    fn test_stamp_without_open_context_is_ignored() {
        let perf = Perf::new(true);
        perf.record_send_call(&request());
        assert_eq!(perf.open_contexts(), 0);
    }
}
