//! Bidirectional control stream between scheduler and runtime
//!
//! One long-lived framed connection per `(instance, runtime)` pair carries
//! Invoke/Call/Notify/Result/Heartbeat traffic in both directions. Outbound
//! writes are serialised through a FIFO queue; replies are demultiplexed by
//! message id against a pending-promise map. Stream failure is terminal;
//! reconnection belongs to the registration layer.

mod codec;
mod control;

pub use codec::{framed_parts, decode_frame, encode_frame};
pub use control::{
    AuthInterceptor, ControlStream, ControlStreamBuilder, ReplyFuture, StreamHandler, StreamRole,
};

use std::time::Duration;

/// Default maximum frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
/// Hard ceiling on the configurable frame size.
pub const MAX_FRAME_SIZE_CEILING: usize = 500 * 1024 * 1024;
/// Lower bound of the reconnect backoff window.
pub const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(500);
/// Upper bound of the reconnect backoff window.
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_millis(5000);
