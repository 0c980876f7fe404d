//! Shared types for the channel layer

use std::fmt;
use thiserror::Error;

use super::channel::Channel;
use super::frame::FrameError;
use super::proxy::ProxyError;

/// Identifies a channel for its whole lifetime inside one multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Correlates a queued message with its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted on a server socket
    Inbound,
    /// Dialled by this node
    Outbound,
}

/// Transport-level lifecycle. Authentication progress is tracked by the
/// connection manager on top of `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    ProxyHandshake,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Why a channel was closed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    Remote,

    #[error("closed locally")]
    Local,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("idle timeout expired")]
    Expired,

    #[error("superseded by a newer channel to the same peer")]
    Superseded,

    #[error("connect timed out")]
    Timeout,

    #[error("multiplexer shut down")]
    Shutdown,
}

impl From<std::io::Error> for CloseReason {
    fn from(e: std::io::Error) -> Self {
        CloseReason::Transport(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Proxy handshake has not completed yet")]
    ProxyPending,

    #[error("Multiplexer is stopped")]
    Stopped,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of an individual send that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send timed out before the peer was ready")]
    Timeout,

    #[error("channel closed before the message was written: {0}")]
    ChannelClosed(CloseReason),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("connection manager is shutting down")]
    Shutdown,

    #[error("send was dropped without an outcome")]
    Dropped,
}

/// Events reported by the multiplexer loop
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connected (and, for proxied channels, past the proxy handshake)
    Opened { channel: Channel },
    Closed { id: ChannelId, reason: CloseReason },
    MessageSent { id: ChannelId, message: MessageId },
    MessageReceived { id: ChannelId, payload: Vec<u8> },
}
