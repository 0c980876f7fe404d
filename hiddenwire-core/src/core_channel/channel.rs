//! Channel handle shared between the multiplexer thread and everyone else.
//!
//! The outbound queue and the lifecycle state sit behind one lock so that
//! "enqueue" and "close drains the queue" cannot interleave: a frame is
//! either written later or failed by the close, never lost.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::frame::FrameError;
use super::multiplexer::{Command, MuxShared};
use super::types::{ChannelError, ChannelId, ChannelState, CloseReason, Direction, MessageId, SendError};
use crate::core_identity::Identifier;

/// Receives the outcome of one queued frame
pub type Completion = oneshot::Sender<Result<(), SendError>>;

/// A payload waiting in a channel's outbound queue
#[derive(Debug)]
pub struct OutboundFrame {
    pub id: MessageId,
    pub payload: Vec<u8>,
    completion: Option<Completion>,
}

impl OutboundFrame {
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload, completion: None }
    }

    pub fn with_completion(id: MessageId, payload: Vec<u8>, completion: Completion) -> Self {
        Self { id, payload, completion: Some(completion) }
    }

    pub(crate) fn complete(self) {
        if let Some(tx) = self.completion {
            let _ = tx.send(Ok(()));
        }
    }

    pub(crate) fn fail(self, error: SendError) {
        if let Some(tx) = self.completion {
            let _ = tx.send(Err(error));
        }
    }
}

/// A frame the channel refused, handed back to the caller
#[derive(Debug)]
pub struct Rejected {
    pub error: ChannelError,
    pub frame: OutboundFrame,
}

struct Queue {
    state: ChannelState,
    frames: VecDeque<OutboundFrame>,
}

struct ChannelInner {
    id: ChannelId,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    max_frame_len: u32,
    queue: Mutex<Queue>,
    peer: Mutex<Option<Identifier>>,
    mux: Arc<MuxShared>,
}

/// Cloneable handle to one duplex connection
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        direction: Direction,
        remote_addr: Option<SocketAddr>,
        state: ChannelState,
        max_frame_len: u32,
        mux: Arc<MuxShared>,
    ) -> Self {
        Channel {
            inner: Arc::new(ChannelInner {
                id,
                direction,
                remote_addr,
                max_frame_len,
                queue: Mutex::new(Queue { state, frames: VecDeque::new() }),
                peer: Mutex::new(None),
                mux,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ChannelState {
        self.inner.queue.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Authenticated peer, once known
    pub fn peer(&self) -> Option<Identifier> {
        self.inner.peer.lock().clone()
    }

    /// Number of frames waiting to be written
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().frames.len()
    }

    /// Queue `payload` for sending. Fails fast while the proxy handshake is
    /// pending or once the channel is closed.
    pub fn add_message(&self, payload: Vec<u8>, id: MessageId) -> Result<(), ChannelError> {
        self.enqueue(OutboundFrame::new(id, payload)).map_err(|rejected| rejected.error)
    }

    /// Queue a frame carrying a completion notifier
    pub fn enqueue(&self, frame: OutboundFrame) -> Result<(), Rejected> {
        if frame.payload.len() > self.inner.max_frame_len as usize {
            let error = FrameError::TooLarge { len: frame.payload.len(), max: self.inner.max_frame_len };
            return Err(Rejected { error: error.into(), frame });
        }

        let was_empty = {
            let mut queue = self.inner.queue.lock();
            match queue.state {
                ChannelState::Closed => return Err(Rejected { error: ChannelError::Closed, frame }),
                ChannelState::ProxyHandshake => {
                    return Err(Rejected { error: ChannelError::ProxyPending, frame })
                }
                ChannelState::Connecting | ChannelState::Open => {}
            }
            queue.frames.push_back(frame);
            queue.frames.len() == 1
        };

        // The loop thread only needs a nudge when the queue goes non-empty
        if was_empty {
            self.inner.mux.post(Command::Flush(self.inner.id));
        }
        Ok(())
    }

    pub(crate) fn set_peer(&self, peer: Identifier) {
        *self.inner.peer.lock() = Some(peer);
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        let mut queue = self.inner.queue.lock();
        if queue.state != ChannelState::Closed {
            queue.state = state;
        }
    }

    pub(crate) fn pop_frame(&self) -> Option<OutboundFrame> {
        self.inner.queue.lock().frames.pop_front()
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.inner.queue.lock().frames.is_empty()
    }

    pub(crate) fn max_frame_len(&self) -> u32 {
        self.inner.max_frame_len
    }

    /// Mark closed and fail everything still queued
    pub(crate) fn close(&self, reason: &CloseReason) {
        let drained: Vec<OutboundFrame> = {
            let mut queue = self.inner.queue.lock();
            queue.state = ChannelState::Closed;
            queue.frames.drain(..).collect()
        };
        for frame in drained {
            frame.fail(SendError::ChannelClosed(reason.clone()));
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .field("peer", &self.peer())
            .finish()
    }
}
