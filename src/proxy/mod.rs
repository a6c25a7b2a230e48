//! Instance routing and RPC dispatch ("bus proxy")
//!
//! One proxy per instance name terminates calls heading for that instance,
//! gates them on readiness, forwards cross-node traffic, and guarantees
//! at-most-once submission per request id. The invocation handler in front
//! applies admission control and adapts client invokes into calls.

mod call_cache;
mod dispatcher;
mod instance_proxy;
mod invocation;
mod perf;
mod router_info;

pub use call_cache::{CallCache, CallReply, CallRequestContext, ResponsePromise, call_response};
pub use dispatcher::{
    CallForwarder, CallResultSink, CallerInfo, Dispatcher, call_result_ack,
};
pub use instance_proxy::{InstanceProxy, MemoryReleaseHook, ProxyManager};
pub use invocation::{CreateCallResultReceiver, InvocationHandler, TokenBucket};
pub use perf::Perf;
pub use router_info::{
    DataPlaneObserver, InstanceRouterInfo, RuntimeClient, StreamRuntimeClient,
};
