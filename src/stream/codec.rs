//! Length-delimited JSON framing for control-stream transports

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::ErrorCode;
use crate::messages::StreamingMessage;

/// Splits a duplex transport into framed read/write halves with the given
/// frame-size limit.
pub fn framed_parts<T>(
    io: T,
    max_frame_size: usize,
) -> (
    FramedRead<ReadHalf<T>, LengthDelimitedCodec>,
    FramedWrite<WriteHalf<T>, LengthDelimitedCodec>,
)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_codec()
    };
    (
        FramedRead::new(read_half, codec()),
        FramedWrite::new(write_half, codec()),
    )
}

/// Serialises one streaming message into a frame body.
pub fn encode_frame(message: &StreamingMessage) -> Result<Bytes, ErrorCode> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|_| ErrorCode::ParamInvalid)
}

/// Parses one frame body back into a streaming message.
pub fn decode_frame(frame: &BytesMut) -> Result<StreamingMessage, ErrorCode> {
    serde_json::from_slice(frame).map_err(|_| ErrorCode::ParamInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Heartbeat, MessageBody};

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = StreamingMessage::request(MessageBody::HeartbeatReq(Heartbeat {
            sender: "runtime-1".to_string(),
        }));
        let bytes = encode_frame(&msg).expect("encode");
        let back = decode_frame(&BytesMut::from(&bytes[..])).expect("decode");
        assert_eq!(back, msg);
    }

    #[test]
    fn test_garbage_frame_is_param_invalid() {
        let garbage = BytesMut::from(&b"not json"[..]);
        assert_eq!(decode_frame(&garbage), Err(ErrorCode::ParamInvalid));
    }
}
