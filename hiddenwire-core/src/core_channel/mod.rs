//! Channel layer: framing, the proxy handshake and the I/O multiplexer

pub mod channel;
pub mod frame;
pub mod message_channel;
pub mod multiplexer;
pub mod proxy;
pub mod types;

pub use channel::{Channel, Completion, OutboundFrame, Rejected};
pub use frame::{encode_frame, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN};
pub use message_channel::{Inbound, MessageChannel};
pub use multiplexer::Multiplexer;
pub use proxy::{ProxyError, ProxyHandshake, ProxyTarget};
pub use types::{
    ChannelError, ChannelEvent, ChannelId, ChannelState, CloseReason, Direction, MessageId, ProtocolViolation,
    SendError,
};
