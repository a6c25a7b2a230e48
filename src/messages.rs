//! Wire messages: the control-stream tagged union and the node-bus envelopes
//!
//! The stream layer treats bodies as opaque except for their tag; the
//! `message_id` is the only identity used to correlate a reply with its
//! request. By convention a request id suffixed with `@initcall` marks the
//! runtime-to-scheduler create-complete notification.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain_types::{EndpointAddress, InstanceId, MessageId, RequestId, TenantId, TraceId};
use crate::error::Status;

/// Request-id suffix marking a create-complete notification.
pub const INITCALL_SUFFIX: &str = "@initcall";

/// Sentinel message id written by a client closing its side of the stream.
pub const LAST_WRITE: &str = "LAST_WRITE";

/// One frame on the bidirectional control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingMessage {
    pub message_id: MessageId,
    pub body: MessageBody,
    /// HMAC stamp filled in by the auth interceptor on non-heartbeat frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStamp>,
}

impl StreamingMessage {
    pub fn new(message_id: MessageId, body: MessageBody) -> Self {
        Self {
            message_id,
            body,
            auth: None,
        }
    }

    /// Builds a frame with a freshly generated message id.
    #[must_use]
    pub fn request(body: MessageBody) -> Self {
        Self::new(MessageId::generate(), body)
    }

    #[must_use]
    pub fn tag(&self) -> BodyTag {
        self.body.tag()
    }

    /// Heartbeats bypass debug logging and the auth interceptor.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self.body,
            MessageBody::HeartbeatReq(_) | MessageBody::HeartbeatRsp(_)
        )
    }
}

/// Signature material carried by authenticated frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStamp {
    pub access_key: String,
    pub timestamp: u64,
    pub signature: String,
}

/// The streaming-message tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    InvokeReq(InvokeRequest),
    InvokeRsp(InvokeResponse),
    CallReq(CallRequest),
    CallRsp(CallResponse),
    CallResultReq(CallResult),
    CallResultAck(CallResultAck),
    NotifyReq(NotifyRequest),
    NotifyRsp(NotifyResponse),
    HeartbeatReq(Heartbeat),
    HeartbeatRsp(Heartbeat),
    SaveReq(SaveRequest),
    SaveRsp(SaveResponse),
    LoadReq(LoadRequest),
    LoadRsp(LoadResponse),
    KillReq(KillRequest),
    KillRsp(KillResponse),
}

impl MessageBody {
    #[must_use]
    pub fn tag(&self) -> BodyTag {
        match self {
            Self::InvokeReq(_) => BodyTag::InvokeReq,
            Self::InvokeRsp(_) => BodyTag::InvokeRsp,
            Self::CallReq(_) => BodyTag::CallReq,
            Self::CallRsp(_) => BodyTag::CallRsp,
            Self::CallResultReq(_) => BodyTag::CallResultReq,
            Self::CallResultAck(_) => BodyTag::CallResultAck,
            Self::NotifyReq(_) => BodyTag::NotifyReq,
            Self::NotifyRsp(_) => BodyTag::NotifyRsp,
            Self::HeartbeatReq(_) => BodyTag::HeartbeatReq,
            Self::HeartbeatRsp(_) => BodyTag::HeartbeatRsp,
            Self::SaveReq(_) => BodyTag::SaveReq,
            Self::SaveRsp(_) => BodyTag::SaveRsp,
            Self::LoadReq(_) => BodyTag::LoadReq,
            Self::LoadRsp(_) => BodyTag::LoadRsp,
            Self::KillReq(_) => BodyTag::KillReq,
            Self::KillRsp(_) => BodyTag::KillRsp,
        }
    }
}

/// Body discriminator used to register stream handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyTag {
    InvokeReq,
    InvokeRsp,
    CallReq,
    CallRsp,
    CallResultReq,
    CallResultAck,
    NotifyReq,
    NotifyRsp,
    HeartbeatReq,
    HeartbeatRsp,
    SaveReq,
    SaveRsp,
    LoadReq,
    LoadRsp,
    KillReq,
    KillRsp,
}

/// Client-facing invocation request terminated by the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub instance_id: InstanceId,
    pub function: String,
    pub request_id: RequestId,
    #[serde(default)]
    pub trace_id: TraceId,
    #[serde(default)]
    pub args: Vec<u8>,
    #[serde(default)]
    pub return_object_ids: Vec<String>,
    #[serde(default)]
    pub invoke_options: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub status: Status,
}

/// Proxy-to-runtime call carrying the original invoke payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub function: String,
    pub request_id: RequestId,
    #[serde(default)]
    pub trace_id: TraceId,
    /// Instance id of the caller, used to route the call result back.
    pub sender_id: InstanceId,
    #[serde(default)]
    pub args: Vec<u8>,
    #[serde(default)]
    pub return_object_ids: Vec<String>,
    #[serde(default)]
    pub create_options: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: Status,
}

/// Terminal notification carrying the user's return payload or error from
/// callee back to caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    /// Destination instance (the original caller).
    pub instance_id: InstanceId,
    pub request_id: RequestId,
    pub status: Status,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub small_objects: Vec<Vec<u8>>,
}

impl CallResult {
    /// Whether this result is the create-complete signal for an instance.
    #[must_use]
    pub fn is_init_call(&self) -> bool {
        self.request_id.as_ref().ends_with(INITCALL_SUFFIX)
    }

    /// The request id with any `@initcall` suffix removed.
    #[must_use]
    pub fn bare_request_id(&self) -> RequestId {
        match self.request_id.as_ref().strip_suffix(INITCALL_SUFFIX) {
            Some(bare) => RequestId::new(bare.to_string()),
            None => self.request_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResultAck {
    pub status: Status,
}

/// Result delivery from proxy into a local runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub request_id: RequestId,
    pub status: Status,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub status: Status,
}

/// Liveness probe; carries the sender's name and no payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub checkpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub checkpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillResponse {
    pub status: Status,
}

/// Point-to-point envelope delivered over the node bus.
///
/// Registration, heartbeat and proxy forwarding all ride this channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    Register {
        from: EndpointAddress,
        payload: String,
    },
    Registered {
        from: EndpointAddress,
        payload: String,
    },
    Ping {
        from: EndpointAddress,
    },
    Pong {
        from: EndpointAddress,
    },
    ForwardCall {
        from: EndpointAddress,
        caller_tenant: TenantId,
        message: StreamingMessage,
    },
    ResponseForwardCall {
        message: StreamingMessage,
    },
    ForwardCallResult {
        from: EndpointAddress,
        message: StreamingMessage,
    },
    ResponseForwardCallResult {
        message: StreamingMessage,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn call_result(request_id: &str) -> CallResult {
        CallResult {
            instance_id: InstanceId::new("caller".to_string()),
            request_id: RequestId::new(request_id.to_string()),
            status: Status::ok(),
            payload: vec![],
            small_objects: vec![],
        }
    }

    #[test]
    fn test_initcall_suffix_detection() {
        let init = call_result("req-7@initcall");
        assert!(init.is_init_call());
        assert_eq!(init.bare_request_id().as_ref(), "req-7");

        let plain = call_result("req-7");
        assert!(!plain.is_init_call());
        assert_eq!(plain.bare_request_id().as_ref(), "req-7");
    }

    #[test]
    fn test_heartbeat_detection() {
        let hb = StreamingMessage::request(MessageBody::HeartbeatReq(Heartbeat::default()));
        assert!(hb.is_heartbeat());
        assert_eq!(hb.tag(), BodyTag::HeartbeatReq);

        let call = StreamingMessage::request(MessageBody::CallRsp(CallResponse {
            status: Status::error(ErrorCode::InstanceExited, "gone"),
        }));
        assert!(!call.is_heartbeat());
    }

    #[test]
    fn test_frame_serde_roundtrip() {
        let msg = StreamingMessage::request(MessageBody::CallReq(CallRequest {
            function: "echo".to_string(),
            request_id: RequestId::new("req-1".to_string()),
            trace_id: TraceId::default(),
            sender_id: InstanceId::new("caller".to_string()),
            args: b"hello".to_vec(),
            return_object_ids: vec![],
            create_options: HashMap::new(),
        }));
        let bytes = serde_json::to_vec(&msg).expect("serialize");
        let back: StreamingMessage = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back, msg);
    }
}
