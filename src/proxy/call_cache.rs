//! The three request buckets behind a dispatcher
//!
//! A call-request context is unique per request id and lives in exactly one
//! bucket at a time: `new` (not yet sent), `on_resp` (sent, awaiting the
//! call response) or `in_progress` (response received, awaiting the terminal
//! result). Buckets keep insertion order so a readiness flip drains waiting
//! requests first-in first-out.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::domain_types::{InstanceId, RequestId, TenantId, TraceId};
use crate::error::{ErrorCode, Status};
use crate::messages::{CallResponse, MessageBody, StreamingMessage};

/// The response future handed to a caller; duplicate submits share it.
pub type CallReply = Shared<BoxFuture<'static, StreamingMessage>>;

/// Builds a `CallRsp` frame carrying `status` under `message_id`.
#[must_use]
pub fn call_response(status: Status, message_id: &crate::domain_types::MessageId) -> StreamingMessage {
    StreamingMessage::new(
        message_id.clone(),
        MessageBody::CallRsp(CallResponse { status }),
    )
}

/// Single-completion promise with a cloneable future.
pub struct ResponsePromise {
    sender: Mutex<Option<oneshot::Sender<StreamingMessage>>>,
    reply: CallReply,
}

impl ResponsePromise {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let reply: CallReply = receiver
            .map(|received| {
                received.unwrap_or_else(|_| {
                    // The dispatcher failed every path without completing;
                    // surface an internal error rather than hanging.
                    StreamingMessage::request(MessageBody::CallRsp(CallResponse {
                        status: Status::error(
                            ErrorCode::InnerCommunication,
                            "call context dropped without a response",
                        ),
                    }))
                })
            })
            .boxed()
            .shared();
        Self {
            sender: Mutex::new(Some(sender)),
            reply,
        }
    }

    /// Completes the promise; later completions are ignored.
    pub fn complete(&self, response: StreamingMessage) {
        if let Some(sender) = self.sender.lock().expect("promise lock").take() {
            let _ = sender.send(response);
        }
    }

    #[must_use]
    pub fn future(&self) -> CallReply {
        self.reply.clone()
    }
}

impl Default for ResponsePromise {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the dispatcher tracks for one outstanding call.
pub struct CallRequestContext {
    /// Instance id of the original caller.
    pub from: InstanceId,
    pub request_id: RequestId,
    pub trace_id: TraceId,
    pub caller_tenant_id: TenantId,
    pub request: StreamingMessage,
    pub response: ResponsePromise,
}

/// Bucketed store of outstanding call contexts.
#[derive(Default)]
pub struct CallCache {
    contexts: HashMap<RequestId, Arc<CallRequestContext>>,
    req_new: Vec<RequestId>,
    req_on_resp: Vec<RequestId>,
    req_in_progress: Vec<RequestId>,
}

fn remove_from(bucket: &mut Vec<RequestId>, request_id: &RequestId) {
    if let Some(position) = bucket.iter().position(|id| id == request_id) {
        bucket.remove(position);
    }
}

impl CallCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a context into `new`; a duplicate request id is ignored.
    pub fn push(&mut self, context: Arc<CallRequestContext>) {
        match self.contexts.entry(context.request_id.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => {}
            std::collections::hash_map::Entry::Vacant(slot) => {
                self.req_new.push(context.request_id.clone());
                slot.insert(context);
            }
        }
    }

    #[must_use]
    pub fn find(&self, request_id: &RequestId) -> Option<Arc<CallRequestContext>> {
        self.contexts.get(request_id).cloned()
    }

    pub fn move_to_on_resp(&mut self, request_id: &RequestId) {
        remove_from(&mut self.req_new, request_id);
        if self.contexts.contains_key(request_id) && !self.req_on_resp.contains(request_id) {
            self.req_on_resp.push(request_id.clone());
        }
    }

    pub fn move_to_in_progress(&mut self, request_id: &RequestId) {
        remove_from(&mut self.req_on_resp, request_id);
        if self.contexts.contains_key(request_id) && !self.req_in_progress.contains(request_id) {
            self.req_in_progress.push(request_id.clone());
        }
    }

    /// Re-queues every sent request for a fresh readiness drain.
    pub fn move_all_to_new(&mut self) {
        let mut resend: Vec<RequestId> = Vec::new();
        resend.append(&mut self.req_on_resp);
        resend.append(&mut self.req_in_progress);
        for request_id in resend {
            if !self.req_new.contains(&request_id) {
                self.req_new.push(request_id);
            }
        }
    }

    pub fn delete_new(&mut self, request_id: &RequestId) {
        remove_from(&mut self.req_new, request_id);
        self.contexts.remove(request_id);
    }

    pub fn delete_on_resp(&mut self, request_id: &RequestId) {
        remove_from(&mut self.req_on_resp, request_id);
        self.contexts.remove(request_id);
    }

    pub fn delete_in_progress(&mut self, request_id: &RequestId) {
        remove_from(&mut self.req_in_progress, request_id);
        self.contexts.remove(request_id);
    }

    #[must_use]
    pub fn new_requests(&self) -> Vec<RequestId> {
        self.req_new.clone()
    }

    #[must_use]
    pub fn on_resp_requests(&self) -> Vec<RequestId> {
        self.req_on_resp.clone()
    }

    #[must_use]
    pub fn in_progress_requests(&self) -> Vec<RequestId> {
        self.req_in_progress.clone()
    }

    /// Response futures of every request awaiting its call response.
    #[must_use]
    pub fn on_resp_futures(&self) -> Vec<CallReply> {
        self.req_on_resp
            .iter()
            .filter_map(|request_id| self.contexts.get(request_id))
            .map(|context| context.response.future())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }
}
