//! Multiplexer - the single readiness loop that owns every socket.
//!
//! One OS thread drives a `mio::Poll`. Other threads never touch a socket:
//! they push a [`Command`] onto the shared queue and wake the poller. The
//! waker is level-persistent, so a wake that lands while the loop is about to
//! block still makes the next `poll` return immediately.
//!
//! Every slot is handled compute-then-act: drive the socket, collect the
//! resulting events, emit them, then either close the slot or refresh its
//! registered interest.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::channel::Channel;
use super::message_channel::{Inbound, MessageChannel};
use super::proxy::{ProxyHandshake, ProxyTarget};
use super::types::{ChannelError, ChannelEvent, ChannelId, ChannelState, CloseReason, Direction};
use crate::config::ChannelConfig;

const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Requests applied on the loop thread between poll iterations
pub(crate) enum Command {
    Listen {
        token: Token,
        listener: TcpListener,
    },
    Register {
        channel: Channel,
        stream: TcpStream,
        connecting: bool,
        proxy: Option<ProxyHandshake>,
    },
    Flush(ChannelId),
    Close(ChannelId, CloseReason),
    ReadInterest(ChannelId, bool),
}

/// State shared by the loop thread and every handle that can post to it
pub(crate) struct MuxShared {
    waker: Waker,
    commands: Mutex<Vec<Command>>,
    stopped: AtomicBool,
    next_token: AtomicUsize,
}

impl MuxShared {
    fn new(poll: &Poll) -> io::Result<Self> {
        Ok(MuxShared {
            waker: Waker::new(poll.registry(), WAKE_TOKEN)?,
            commands: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        })
    }

    /// Queue a command and wake the loop. Returns false once stopped.
    pub(crate) fn post(&self, command: Command) -> bool {
        {
            let mut commands = self.commands.lock();
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            commands.push(command);
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake multiplexer");
        }
        true
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn mark_stopped(&self) {
        let _commands = self.commands.lock();
        self.stopped.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Shared state with no loop behind it, for exercising handles directly
    #[cfg(test)]
    pub(crate) fn detached() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        Ok(Arc::new(Self::new(&poll)?))
    }
}

enum LoopState {
    Idle(Poll),
    Running(JoinHandle<()>),
    Finished,
}

/// Handle to the I/O loop
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    config: ChannelConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Mutex<LoopState>,
}

impl Multiplexer {
    /// Create a stopped multiplexer reporting to `events`
    pub fn new(config: ChannelConfig, events: mpsc::UnboundedSender<ChannelEvent>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let shared = Arc::new(MuxShared::new(&poll)?);
        Ok(Multiplexer { shared, config, events, state: Mutex::new(LoopState::Idle(poll)) })
    }

    /// Spawn the loop thread. Calling again while running is a no-op.
    pub fn start(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, LoopState::Finished) {
            LoopState::Idle(poll) => {
                let event_loop = EventLoop::new(poll, self.shared.clone(), self.config.clone(), self.events.clone());
                let handle = thread::Builder::new()
                    .name("hiddenwire-mux".into())
                    .spawn(move || event_loop.run())?;
                debug!("Multiplexer started");
                *state = LoopState::Running(handle);
                Ok(())
            }
            running @ LoopState::Running(_) => {
                *state = running;
                Ok(())
            }
            LoopState::Finished => Err(ChannelError::Stopped),
        }
    }

    /// Stop the loop, closing every channel, and wait for the thread to exit.
    /// No events are emitted after this returns.
    pub fn stop(&self) {
        self.shared.mark_stopped();
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Failed to wake multiplexer for shutdown");
        }

        let previous = mem::replace(&mut *self.state.lock(), LoopState::Finished);
        match previous {
            LoopState::Running(handle) => {
                if handle.join().is_err() {
                    error!("Multiplexer thread panicked");
                }
                debug!("Multiplexer stopped");
            }
            LoopState::Idle(poll) => {
                // Never started: release whatever was queued from this thread
                EventLoop::new(poll, self.shared.clone(), self.config.clone(), self.events.clone()).shutdown();
            }
            LoopState::Finished => {}
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), LoopState::Running(_)) && !self.shared.is_stopped()
    }

    /// Start accepting on `listener`; returns its bound address
    pub fn add_server_socket(&self, listener: std::net::TcpListener) -> Result<SocketAddr, ChannelError> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let token = self.shared.next_token();
        let listener = TcpListener::from_std(listener);
        if !self.shared.post(Command::Listen { token, listener }) {
            return Err(ChannelError::Stopped);
        }
        debug!(%addr, "Listening for channels");
        Ok(addr)
    }

    /// Begin a non-blocking connect to `addr`. With `proxy`, `addr` is the
    /// SOCKS endpoint and the channel opens once the proxy grants `proxy`.
    pub fn connect(&self, addr: SocketAddr, proxy: Option<ProxyTarget>) -> Result<Channel, ChannelError> {
        if self.shared.is_stopped() {
            return Err(ChannelError::Stopped);
        }
        let handshake = proxy.map(ProxyHandshake::new).transpose()?;
        let stream = TcpStream::connect(addr)?;
        let state = if handshake.is_some() {
            ChannelState::ProxyHandshake
        } else {
            ChannelState::Connecting
        };
        let channel = self.new_channel(Direction::Outbound, Some(addr), state);
        trace!(channel = %channel.id(), %addr, proxied = handshake.is_some(), "Connecting");

        let command = Command::Register { channel: channel.clone(), stream, connecting: true, proxy: handshake };
        if !self.shared.post(command) {
            channel.close(&CloseReason::Shutdown);
            return Err(ChannelError::Stopped);
        }
        Ok(channel)
    }

    /// Adopt an already connected stream
    pub fn add_channel(&self, stream: std::net::TcpStream, direction: Direction) -> Result<Channel, ChannelError> {
        stream.set_nonblocking(true)?;
        let remote = stream.peer_addr().ok();
        let channel = self.new_channel(direction, remote, ChannelState::Open);
        let stream = TcpStream::from_std(stream);

        let command = Command::Register { channel: channel.clone(), stream, connecting: false, proxy: None };
        if !self.shared.post(command) {
            channel.close(&CloseReason::Shutdown);
            return Err(ChannelError::Stopped);
        }
        Ok(channel)
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.close(channel, CloseReason::Local);
    }

    /// Close `channel` on the loop thread; `Closed` carries `reason`
    pub fn close(&self, channel: &Channel, reason: CloseReason) {
        self.shared.post(Command::Close(channel.id(), reason));
    }

    /// Toggle read polling for `channel`
    pub fn register_read(&self, channel: &Channel, enabled: bool) {
        self.shared.post(Command::ReadInterest(channel.id(), enabled));
    }

    fn new_channel(&self, direction: Direction, remote: Option<SocketAddr>, state: ChannelState) -> Channel {
        let token = self.shared.next_token();
        Channel::new(ChannelId(token.0), direction, remote, state, self.config.max_frame_len, self.shared.clone())
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Slot {
    io: MessageChannel<TcpStream>,
    connecting: bool,
    read_enabled: bool,
    interest: Option<Interest>,
}

impl Slot {
    fn desired_interest(&self) -> Option<Interest> {
        if self.connecting {
            return Some(Interest::WRITABLE);
        }
        let read = self.read_enabled || self.io.proxy_pending();
        match (read, self.io.wants_write()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Connect completion check for a non-blocking stream
fn connect_finished(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Advance one slot. Events land in `out` in stream order.
fn drive(slot: &mut Slot, readable: bool, mut writable: bool, out: &mut Vec<ChannelEvent>) -> Option<CloseReason> {
    let channel = slot.io.handle().clone();
    let id = channel.id();

    if slot.connecting {
        if !readable && !writable {
            return None;
        }
        match connect_finished(slot.io.stream()) {
            Ok(false) => return None,
            Ok(true) => {
                slot.connecting = false;
                if let Err(e) = slot.io.stream().set_nodelay(true) {
                    trace!(channel = %id, error = %e, "Could not set TCP_NODELAY");
                }
                if slot.io.proxy_pending() {
                    trace!(channel = %id, "Connected to proxy");
                } else {
                    channel.set_state(ChannelState::Open);
                    out.push(ChannelEvent::Opened { channel: channel.clone() });
                }
                writable = true;
            }
            Err(e) => return Some(e.into()),
        }
    }

    if writable {
        let written = slot.io.write();
        out.extend(written.sent.into_iter().map(|message| ChannelEvent::MessageSent { id, message }));
        if written.close.is_some() {
            return written.close;
        }
    }

    if readable && (slot.read_enabled || slot.io.proxy_pending()) {
        let read = slot.io.read();
        for inbound in read.inbound {
            out.push(match inbound {
                Inbound::ProxyEstablished => ChannelEvent::Opened { channel: channel.clone() },
                Inbound::Frame(payload) => ChannelEvent::MessageReceived { id, payload },
            });
        }
        if read.close.is_some() {
            return read.close;
        }
    }

    None
}

struct EventLoop {
    poll: Poll,
    shared: Arc<MuxShared>,
    config: ChannelConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    listeners: HashMap<Token, TcpListener>,
    slots: HashMap<Token, Slot>,
}

impl EventLoop {
    fn new(
        poll: Poll,
        shared: Arc<MuxShared>,
        config: ChannelConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        EventLoop { poll, shared, config, events, listeners: HashMap::new(), slots: HashMap::new() }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            self.apply_commands();
            if self.shared.is_stopped() {
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed, shutting down multiplexer");
                self.shared.mark_stopped();
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if self.listeners.contains_key(&token) {
                    self.accept(token);
                    continue;
                }
                let failed = event.is_error();
                let readable = event.is_readable() || event.is_read_closed() || failed;
                let writable = event.is_writable() || event.is_write_closed() || failed;
                self.ready(token, readable, writable);
            }
        }

        self.shutdown();
    }

    fn apply_commands(&mut self) {
        let commands = mem::take(&mut *self.shared.commands.lock());
        for command in commands {
            match command {
                Command::Listen { token, mut listener } => {
                    if let Err(e) = self.poll.registry().register(&mut listener, token, Interest::READABLE) {
                        error!(error = %e, "Failed to register listener");
                        continue;
                    }
                    self.listeners.insert(token, listener);
                    self.accept(token);
                }
                Command::Register { channel, stream, connecting, proxy } => {
                    self.install(channel, stream, connecting, proxy);
                }
                Command::Flush(id) => self.ready(Token(id.as_usize()), false, true),
                Command::Close(id, reason) => self.close_slot(Token(id.as_usize()), reason),
                Command::ReadInterest(id, enabled) => {
                    let token = Token(id.as_usize());
                    let Some(slot) = self.slots.get_mut(&token) else {
                        continue;
                    };
                    slot.read_enabled = enabled;
                    if enabled {
                        // Data may have arrived while reads were off
                        self.ready(token, true, false);
                    } else {
                        self.update_interest(token);
                    }
                }
            }
        }
    }

    fn install(&mut self, channel: Channel, stream: TcpStream, connecting: bool, proxy: Option<ProxyHandshake>) {
        let token = Token(channel.id().as_usize());
        if !connecting {
            self.emit(ChannelEvent::Opened { channel: channel.clone() });
        }
        let io = MessageChannel::new(stream, channel, self.config.read_buffer_size, proxy);
        self.slots.insert(token, Slot { io, connecting, read_enabled: true, interest: None });
        self.ready(token, !connecting, true);
    }

    fn accept(&mut self, token: Token) {
        loop {
            let accepted = match self.listeners.get(&token) {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "Could not set TCP_NODELAY");
                    }
                    let id = ChannelId(self.shared.next_token().0);
                    let channel = Channel::new(
                        id,
                        Direction::Inbound,
                        Some(addr),
                        ChannelState::Open,
                        self.config.max_frame_len,
                        self.shared.clone(),
                    );
                    debug!(channel = %id, %addr, "Accepted channel");
                    self.install(channel, stream, false, None);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    fn ready(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        let mut out = Vec::new();
        let close = drive(slot, readable, writable, &mut out);
        for event in out {
            self.emit(event);
        }
        match close {
            Some(reason) => self.close_slot(token, reason),
            None => self.update_interest(token),
        }
    }

    fn update_interest(&mut self, token: Token) {
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        let desired = slot.desired_interest();
        if desired == slot.interest {
            return;
        }

        let registry = self.poll.registry();
        let stream = slot.io.stream_mut();
        let result = match (slot.interest, desired) {
            (None, Some(interest)) => registry.register(stream, token, interest),
            (Some(_), Some(interest)) => registry.reregister(stream, token, interest),
            (Some(_), None) => registry.deregister(stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => slot.interest = desired,
            Err(e) => self.close_slot(token, e.into()),
        }
    }

    fn close_slot(&mut self, token: Token, reason: CloseReason) {
        let Some(mut slot) = self.slots.remove(&token) else {
            return;
        };
        if slot.interest.is_some() {
            let _ = self.poll.registry().deregister(slot.io.stream_mut());
        }
        let id = slot.io.handle().id();
        debug!(channel = %id, %reason, "Channel closed");
        slot.io.abort(&reason);
        self.emit(ChannelEvent::Closed { id, reason });
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            trace!("Channel event receiver dropped");
        }
    }

    fn shutdown(mut self) {
        let unapplied = mem::take(&mut *self.shared.commands.lock());
        for command in unapplied {
            if let Command::Register { channel, .. } = command {
                channel.close(&CloseReason::Shutdown);
                self.emit(ChannelEvent::Closed { id: channel.id(), reason: CloseReason::Shutdown });
            }
        }

        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.close_slot(token, CloseReason::Shutdown);
        }
        for (_, mut listener) in self.listeners.drain() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}
