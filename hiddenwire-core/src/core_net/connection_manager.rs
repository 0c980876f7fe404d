/*
    ConnectionManager

    Maps peer identifiers to authenticated channels and hides dialling,
    the proxy handshake and authentication behind `send(peer, bytes, timeout)`.

    Workflow of a send to a peer with no channel yet:

      send() ──► DispatchQueue ──► dispatch(): no route ──► request_dial ──► actor
                     ▲  (declined, retried)                                  │
                     │                                                      ▼
                     │                                  Multiplexer::connect via SOCKS proxy
                     │                                                      │ Opened
                     │                                                      ▼
                     │                                          Authenticator (initiator)
                     │                                                      │ Succeeded
                     └──────────── wake(peer) ◄── route installed, TTL armed ┘

    The actor task is the only place that reacts to channel events; other
    threads read the route table through `ManagerShared`.

    Re-authentication policy: the last successful authentication for an
    identifier wins. The channel it replaces is closed with
    `CloseReason::Superseded` and does not produce `PeerDisconnected`.
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::dispatch_queue::{Dispatch, DispatchQueue, DispatchTarget, PendingSend};
use super::errors::ConnectionError;
use super::metrics;
use super::ttl_manager::TtlManager;
use crate::config::Config;
use crate::core_auth::{self, AuthError, AuthStep, Authenticator};
use crate::core_channel::{
    Channel, ChannelError, ChannelEvent, ChannelId, CloseReason, Direction, MessageId, Multiplexer, OutboundFrame,
    ProtocolViolation, ProxyTarget, Rejected, SendError,
};
use crate::core_identity::{CryptoIdentity, Identifier};

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    PeerConnected { peer: Identifier, direction: Direction },
    PeerDisconnected { peer: Identifier, reason: CloseReason },
    MessageReceived { from: Identifier, payload: Vec<u8> },
    AuthenticationFailed { channel: ChannelId, remote: Option<Identifier>, error: AuthError },
}

/// Handle to one accepted send
#[derive(Debug)]
pub struct Delivery {
    id: MessageId,
    destination: Identifier,
    outcome: oneshot::Receiver<Result<(), SendError>>,
}

impl Delivery {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn destination(&self) -> &Identifier {
        &self.destination
    }

    /// Resolves once the frame is written, or with the reason it never will be
    pub async fn wait(self) -> Result<(), SendError> {
        self.outcome.await.unwrap_or(Err(SendError::Dropped))
    }
}

enum Command {
    Dial(Identifier),
    HandshakeTimeout(ChannelId),
    Disconnect(Identifier),
    Shutdown,
}

enum DialState {
    InFlight,
    Backoff(Instant),
}

/// State read by the dispatch workers and the public handle
struct ManagerShared {
    config: Config,
    routes: Mutex<HashMap<Identifier, Channel>>,
    dials: Mutex<HashMap<Identifier, DialState>>,
    ttl: Arc<TtlManager>,
    commands: mpsc::UnboundedSender<Command>,
    next_message: AtomicU64,
    stopped: AtomicBool,
}

impl ManagerShared {
    fn next_message_id(&self) -> MessageId {
        MessageId(self.next_message.fetch_add(1, Ordering::Relaxed))
    }

    fn route(&self, peer: &Identifier) -> Option<Channel> {
        self.routes.lock().get(peer).cloned()
    }

    /// Ask the actor to dial `peer` unless a dial is running or backing off
    fn request_dial(&self, peer: &Identifier) {
        let mut dials = self.dials.lock();
        prune_backoff(&mut dials, Instant::now());
        match dials.get(peer) {
            Some(DialState::InFlight) => return,
            Some(DialState::Backoff(until)) if Instant::now() < *until => return,
            _ => {}
        }
        if self.commands.send(Command::Dial(peer.clone())).is_ok() {
            dials.insert(peer.clone(), DialState::InFlight);
        }
    }

    fn touch(&self, peer: &Identifier) {
        self.ttl.set(peer.clone(), self.config.ttl.idle_timeout);
    }
}

/// Drop backoff entries whose delay has passed
fn prune_backoff(dials: &mut HashMap<Identifier, DialState>, now: Instant) {
    dials.retain(|_, state| match state {
        DialState::InFlight => true,
        DialState::Backoff(until) => *until > now,
    });
}

impl DispatchTarget for ManagerShared {
    fn dispatch(&self, send: PendingSend) -> Dispatch {
        if self.stopped.load(Ordering::Acquire) {
            return Dispatch::Failed(send, SendError::Shutdown);
        }

        let Some(channel) = self.route(&send.destination) else {
            self.request_dial(&send.destination);
            return Dispatch::Declined(send);
        };

        let PendingSend { destination, frame, timeout, enqueued_at } = send;
        match channel.enqueue(frame) {
            Ok(()) => {
                self.touch(&destination);
                Dispatch::Accepted
            }
            // Stale route; the actor is about to process the close
            Err(Rejected { error: ChannelError::Closed, frame }) => {
                Dispatch::Declined(PendingSend { destination, frame, timeout, enqueued_at })
            }
            Err(Rejected { error, frame }) => Dispatch::Failed(
                PendingSend { destination, frame, timeout, enqueued_at },
                SendError::Rejected(error.to_string()),
            ),
        }
    }
}

enum Handler {
    Idle,
    Authenticating(Box<dyn Authenticator>),
    Application(Identifier),
}

struct ChannelRecord {
    channel: Channel,
    /// Identifier we dialled, for outbound channels
    remote: Option<Identifier>,
    handler: Handler,
    handshake_timer: Option<AbortHandle>,
}

impl ChannelRecord {
    fn cancel_handshake_timer(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
    }
}

struct Actor {
    shared: Arc<ManagerShared>,
    identity: Arc<CryptoIdentity>,
    mux: Arc<Multiplexer>,
    dispatch: Arc<DispatchQueue>,
    channels: HashMap<ChannelId, ChannelRecord>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut expirations: mpsc::UnboundedReceiver<Identifier>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                Some(event) = channel_events.recv() => self.on_channel_event(event),
                Some(peer) = expirations.recv() => self.on_expired(peer),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        debug!("Connection manager actor stopped");
    }

    /// Never waits on the application
    fn emit(&self, event: ManagerEvent) {
        if self.events.send(event).is_err() {
            trace!("Manager event receiver dropped");
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial(peer) => self.dial(peer),
            Command::HandshakeTimeout(id) => {
                if let Some(record) = self.channels.get(&id) {
                    if !matches!(record.handler, Handler::Application(_)) {
                        debug!(channel = %id, direction = ?record.channel.direction(), "Handshake timed out");
                        self.mux.close(&record.channel, CloseReason::Timeout);
                    }
                }
            }
            Command::Disconnect(peer) => {
                self.shared.ttl.remove(&peer);
                if let Some(channel) = self.shared.route(&peer) {
                    self.mux.close(&channel, CloseReason::Local);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn dial(&mut self, peer: Identifier) {
        let network = &self.shared.config.network;
        let target = ProxyTarget::new(peer.as_str(), network.hidden_service_port);

        let channel = match self.mux.connect(network.proxy_address, Some(target)) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dial failed");
                self.dial_failed(&peer);
                return;
            }
        };
        debug!(peer = %peer, channel = %channel.id(), "Dialling");

        let id = channel.id();
        let timer = self.arm_handshake_timer(id);
        self.channels.insert(
            id,
            ChannelRecord { channel, remote: Some(peer), handler: Handler::Idle, handshake_timer: Some(timer) },
        );
    }

    /// Close `id` unless it authenticates within `network.connect_timeout`
    fn arm_handshake_timer(&self, id: ChannelId) -> AbortHandle {
        let commands = self.shared.commands.clone();
        let connect_timeout = self.shared.config.network.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(connect_timeout).await;
            let _ = commands.send(Command::HandshakeTimeout(id));
        })
        .abort_handle()
    }

    fn dial_failed(&self, peer: &Identifier) {
        let now = Instant::now();
        let mut dials = self.shared.dials.lock();
        prune_backoff(&mut dials, now);
        dials.insert(peer.clone(), DialState::Backoff(now + self.shared.config.dispatch.reconnect_delay));
    }

    fn on_expired(&mut self, peer: Identifier) {
        metrics::ttl_expired();
        if let Some(channel) = self.shared.route(&peer) {
            debug!(peer = %peer, "Closing idle channel");
            self.mux.close(&channel, CloseReason::Expired);
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened { channel } => self.on_opened(channel),
            ChannelEvent::MessageReceived { id, payload } => self.on_frame(id, payload),
            ChannelEvent::MessageSent { .. } => metrics::frame_sent(),
            ChannelEvent::Closed { id, reason } => self.on_closed(id, reason),
        }
    }

    fn on_opened(&mut self, channel: Channel) {
        let id = channel.id();
        let auth_config = &self.shared.config.auth;

        let authenticator = match channel.direction() {
            Direction::Outbound => {
                metrics::proxy_handshake(true);
                let Some(record) = self.channels.get_mut(&id) else {
                    // Dialled by someone else on this multiplexer
                    return;
                };
                let Some(remote) = record.remote.clone() else {
                    return;
                };
                core_auth::initiator(auth_config, self.identity.clone(), remote)
            }
            Direction::Inbound => {
                trace!(channel = %id, remote = ?channel.remote_addr(), "Inbound channel");
                let timer = self.arm_handshake_timer(id);
                self.channels.insert(
                    id,
                    ChannelRecord {
                        channel: channel.clone(),
                        remote: None,
                        handler: Handler::Idle,
                        handshake_timer: Some(timer),
                    },
                );
                core_auth::responder(auth_config, self.identity.clone(), None)
            }
        };

        let Some(record) = self.channels.get_mut(&id) else {
            return;
        };
        record.handler = Handler::Authenticating(authenticator);
        let step = match &mut record.handler {
            Handler::Authenticating(auth) => auth.start(),
            _ => return,
        };
        self.apply_step(id, step);
    }

    fn on_frame(&mut self, id: ChannelId, payload: Vec<u8>) {
        let Some(record) = self.channels.get_mut(&id) else {
            return;
        };
        match &mut record.handler {
            Handler::Authenticating(auth) => {
                let step = auth.receive(&payload);
                self.apply_step(id, step);
            }
            Handler::Application(peer) => {
                let from = peer.clone();
                metrics::frame_received();
                self.shared.touch(&from);
                self.emit(ManagerEvent::MessageReceived { from, payload });
            }
            Handler::Idle => trace!(channel = %id, "Dropping frame on idle channel"),
        }
    }

    fn apply_step(&mut self, id: ChannelId, step: AuthStep) {
        let Some(record) = self.channels.get_mut(&id) else {
            return;
        };

        match step {
            AuthStep::Continue { send } => {
                if let Some(frame) = send {
                    let message = self.shared.next_message_id();
                    if let Err(e) = record.channel.add_message(frame, message) {
                        debug!(channel = %id, error = %e, "Could not send handshake frame");
                    }
                }
            }
            AuthStep::Succeeded { peer, send } => {
                if let Some(frame) = send {
                    let message = self.shared.next_message_id();
                    if let Err(e) = record.channel.add_message(frame, message) {
                        debug!(channel = %id, error = %e, "Could not send handshake reply");
                    }
                }
                record.cancel_handshake_timer();
                record.handler = Handler::Application(peer.clone());
                record.channel.set_peer(peer.clone());
                let channel = record.channel.clone();
                let direction = channel.direction();
                self.on_authenticated(peer, channel, direction);
            }
            AuthStep::Failed(error) => {
                record.handler = Handler::Idle;
                let channel = record.channel.clone();
                let remote = record.remote.clone();
                warn!(channel = %id, peer = ?remote, %error, "Authentication failed");
                metrics::authentication_failed(error.kind());
                self.mux.close(&channel, CloseReason::Authentication(error.to_string()));
                self.emit(ManagerEvent::AuthenticationFailed { channel: id, remote, error });
            }
        }
    }

    fn on_authenticated(&mut self, peer: Identifier, channel: Channel, direction: Direction) {
        metrics::authentication_succeeded();
        self.shared.dials.lock().remove(&peer);

        let (previous, active) = {
            let mut routes = self.shared.routes.lock();
            let previous = routes.insert(peer.clone(), channel.clone());
            (previous, routes.len())
        };
        if let Some(previous) = previous.filter(|previous| *previous != channel) {
            debug!(peer = %peer, old = %previous.id(), new = %channel.id(), "Superseding channel");
            self.mux.close(&previous, CloseReason::Superseded);
        }
        metrics::set_active_peers(active);

        self.shared.touch(&peer);
        info!(peer = %peer, channel = %channel.id(), ?direction, "Peer connected");
        self.dispatch.wake(&peer);
        self.emit(ManagerEvent::PeerConnected { peer, direction });
    }

    fn on_closed(&mut self, id: ChannelId, reason: CloseReason) {
        let Some(mut record) = self.channels.remove(&id) else {
            return;
        };
        record.cancel_handshake_timer();

        if let CloseReason::Protocol(violation) = &reason {
            match violation {
                ProtocolViolation::Frame(_) => metrics::oversized_frame_rejected(),
                ProtocolViolation::Proxy(_) => metrics::proxy_handshake(false),
            }
        }

        match record.handler {
            Handler::Application(peer) => {
                let (removed, active) = {
                    let mut routes = self.shared.routes.lock();
                    let current = routes.get(&peer).is_some_and(|route| *route == record.channel);
                    if current {
                        routes.remove(&peer);
                    }
                    (current, routes.len())
                };
                if removed {
                    self.shared.ttl.remove(&peer);
                    metrics::set_active_peers(active);
                    info!(peer = %peer, %reason, "Peer disconnected");
                    self.emit(ManagerEvent::PeerDisconnected { peer, reason });
                }
            }
            Handler::Idle | Handler::Authenticating(_) => {
                if let Some(remote) = record.remote {
                    debug!(peer = %remote, %reason, "Dial did not complete");
                    self.dial_failed(&remote);
                }
            }
        }
    }
}

/// Owns the multiplexer, TTL manager, dispatch workers and the actor task
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    identifier: Identifier,
    local_addr: SocketAddr,
    mux: Arc<Multiplexer>,
    dispatch: Arc<DispatchQueue>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Bind the hidden-service target address and start every component.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Config,
        identity: Arc<CryptoIdentity>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ManagerEvent>), ConnectionError> {
        config.validate()?;
        let identifier = identity.identifier()?;

        let listen_address = config.network.listen_address;
        let listener = std::net::TcpListener::bind(listen_address)
            .map_err(|source| ConnectionError::Bind { addr: listen_address, source })?;

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let mux = Arc::new(Multiplexer::new(config.channel.clone(), channel_tx)?);
        let local_addr = mux.add_server_socket(listener)?;
        mux.start()?;

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let ttl = Arc::new(TtlManager::start(config.ttl.tick, expired_tx));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ManagerShared {
            config,
            routes: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
            ttl,
            commands: command_tx,
            next_message: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });

        let dispatch = Arc::new(DispatchQueue::start(
            shared.config.dispatch.workers,
            shared.config.dispatch.retry_interval,
            shared.clone(),
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            shared: shared.clone(),
            identity,
            mux: mux.clone(),
            dispatch: dispatch.clone(),
            channels: HashMap::new(),
            events: event_tx,
        };
        let actor = tokio::spawn(actor.run(channel_rx, expired_rx, command_rx));

        info!(peer = %identifier, %local_addr, "Connection manager started");
        let manager = ConnectionManager {
            shared,
            identifier,
            local_addr,
            mux,
            dispatch,
            actor: Mutex::new(Some(actor)),
        };
        Ok((manager, event_rx))
    }

    /// Our own identifier
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Address the hidden service should forward to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `payload` to `to`, dialling and authenticating first if needed.
    /// `timeout` bounds how long the send may wait for a ready channel
    /// (defaults to `dispatch.default_timeout`).
    pub fn send(
        &self,
        to: &Identifier,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Delivery, ConnectionError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ConnectionError::Stopped);
        }
        let max = self.shared.config.channel.max_frame_len;
        if payload.len() > max as usize {
            return Err(ConnectionError::PayloadTooLarge { len: payload.len(), max });
        }

        let id = self.shared.next_message_id();
        let (tx, rx) = oneshot::channel();
        let frame = OutboundFrame::with_completion(id, payload, tx);
        let timeout = timeout.unwrap_or(self.shared.config.dispatch.default_timeout);
        let delivery = Delivery { id, destination: to.clone(), outcome: rx };

        // Straight onto the channel when nothing is queued for this peer. A send a
        // worker is handing over right now can still be overtaken; only frames
        // already on one channel keep their order.
        let frame = match self.shared.route(to) {
            Some(channel) if self.dispatch.pending(to) == 0 => match channel.enqueue(frame) {
                Ok(()) => {
                    self.shared.touch(to);
                    return Ok(delivery);
                }
                Err(rejected) => rejected.frame,
            },
            _ => frame,
        };

        match self.dispatch.enqueue(PendingSend::new(to.clone(), frame, timeout)) {
            Ok(()) => Ok(delivery),
            Err(_) => Err(ConnectionError::Stopped),
        }
    }

    /// Close the channel to `peer`, if any
    pub fn disconnect(&self, peer: &Identifier) -> Result<(), ConnectionError> {
        self.shared
            .commands
            .send(Command::Disconnect(peer.clone()))
            .map_err(|_| ConnectionError::Stopped)
    }

    /// Peers with an authenticated channel
    pub fn connected_peers(&self) -> Vec<Identifier> {
        self.shared.routes.lock().keys().cloned().collect()
    }

    pub fn is_connected(&self, peer: &Identifier) -> bool {
        self.shared.routes.lock().contains_key(peer)
    }

    /// Stop dispatching, close every channel and halt all tasks.
    /// Queued sends fail with `SendError::Shutdown`. Idempotent.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.dispatch.stop().await;

        let _ = self.shared.commands.send(Command::Shutdown);
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            actor.abort();
            let _ = actor.await;
        }

        let mux = self.mux.clone();
        if tokio::task::spawn_blocking(move || mux.stop()).await.is_err() {
            warn!("Multiplexer shutdown task failed");
        }

        self.shared.ttl.stop().await;
        self.shared.routes.lock().clear();
        self.shared.dials.lock().clear();
        metrics::set_active_peers(0);
        info!(peer = %self.identifier, "Connection manager stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.shared.commands.send(Command::Shutdown);
        }
    }
}
