//! MessageChannel - framing over one non-blocking byte stream.
//!
//! Driven only by the multiplexer thread. `read` and `write` go until the
//! stream reports `WouldBlock` (the poller is edge-triggered), so progress on
//! a partially written or partially read frame persists across calls.

use std::io::{self, Read, Write};

use super::channel::{Channel, OutboundFrame};
use super::frame::{encode_frame, FrameDecoder};
use super::proxy::ProxyHandshake;
use super::types::{ChannelState, CloseReason, MessageId, ProtocolViolation, SendError};

/// Something the read side produced, in stream order
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Proxy granted the connection; framing is now live
    ProxyEstablished,
    Frame(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub inbound: Vec<Inbound>,
    /// Set when the channel must be closed after delivering `inbound`
    pub close: Option<CloseReason>,
}

#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub sent: Vec<MessageId>,
    pub close: Option<CloseReason>,
}

struct Writing {
    frame: OutboundFrame,
    bytes: Vec<u8>,
    pos: usize,
}

pub struct MessageChannel<S> {
    stream: S,
    handle: Channel,
    decoder: FrameDecoder,
    writing: Option<Writing>,
    proxy: Option<ProxyHandshake>,
    read_buf: Vec<u8>,
}

impl<S: Read + Write> MessageChannel<S> {
    pub fn new(stream: S, handle: Channel, read_buffer_size: usize, proxy: Option<ProxyHandshake>) -> Self {
        let max = handle.max_frame_len();
        MessageChannel {
            stream,
            handle,
            decoder: FrameDecoder::new(max),
            writing: None,
            proxy,
            read_buf: vec![0; read_buffer_size.max(1)],
        }
    }

    pub fn handle(&self) -> &Channel {
        &self.handle
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn proxy_pending(&self) -> bool {
        self.proxy.is_some()
    }

    /// Whether the multiplexer should poll for writability
    pub fn wants_write(&self) -> bool {
        match &self.proxy {
            Some(handshake) => !handshake.request_sent(),
            None => self.writing.is_some() || self.handle.has_queued(),
        }
    }

    pub fn read(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();

        loop {
            if let Some(handshake) = self.proxy.as_mut() {
                match self.stream.read(handshake.reply_space()) {
                    Ok(0) => {
                        let violation = ProtocolViolation::Proxy(handshake.truncated());
                        outcome.close = Some(CloseReason::Protocol(violation));
                        break;
                    }
                    Ok(n) => match handshake.mark_received(n) {
                        None => {}
                        Some(Ok(())) => {
                            self.proxy = None;
                            self.handle.set_state(ChannelState::Open);
                            outcome.inbound.push(Inbound::ProxyEstablished);
                        }
                        Some(Err(e)) => {
                            outcome.close = Some(CloseReason::Protocol(e.into()));
                            break;
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        outcome.close = Some(e.into());
                        break;
                    }
                }
                continue;
            }

            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    outcome.close = Some(CloseReason::Remote);
                    break;
                }
                Ok(n) => match self.decoder.decode(&self.read_buf[..n]) {
                    Ok(frames) => outcome.inbound.extend(frames.into_iter().map(Inbound::Frame)),
                    Err(e) => {
                        outcome.close = Some(CloseReason::Protocol(e.into()));
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    outcome.close = Some(e.into());
                    break;
                }
            }
        }

        outcome
    }

    pub fn write(&mut self) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();

        loop {
            if let Some(handshake) = self.proxy.as_mut() {
                if handshake.request_sent() {
                    // Frames wait for the proxy reply
                    break;
                }
                match self.stream.write(handshake.unsent()) {
                    Ok(0) => {
                        outcome.close = Some(io::Error::from(io::ErrorKind::WriteZero).into());
                        break;
                    }
                    Ok(n) => handshake.mark_written(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        outcome.close = Some(e.into());
                        break;
                    }
                }
                continue;
            }

            if self.writing.is_none() {
                let Some(frame) = self.handle.pop_frame() else {
                    break;
                };
                match encode_frame(&frame.payload, self.handle.max_frame_len()) {
                    Ok(bytes) => self.writing = Some(Writing { frame, bytes, pos: 0 }),
                    Err(e) => {
                        frame.fail(SendError::Rejected(e.to_string()));
                        continue;
                    }
                }
            }

            let Some(current) = self.writing.as_mut() else {
                break;
            };
            match self.stream.write(&current.bytes[current.pos..]) {
                Ok(0) => {
                    outcome.close = Some(io::Error::from(io::ErrorKind::WriteZero).into());
                    break;
                }
                Ok(n) => {
                    current.pos += n;
                    if current.pos == current.bytes.len() {
                        if let Some(done) = self.writing.take() {
                            outcome.sent.push(done.frame.id);
                            done.frame.complete();
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    outcome.close = Some(e.into());
                    break;
                }
            }
        }

        if outcome.close.is_none() {
            let _ = self.stream.flush();
        }
        outcome
    }

    /// Fail the in-flight frame and everything queued behind it
    pub fn abort(&mut self, reason: &CloseReason) {
        if let Some(current) = self.writing.take() {
            current.frame.fail(SendError::ChannelClosed(reason.clone()));
        }
        self.handle.close(reason);
    }
}
