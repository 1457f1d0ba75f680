//! TCP tunnel proxy engine
//!
//! Owns the local listener and multiplexes accepted TCP connections over a
//! message transport as framed tunnel events. All registry and state
//! mutation is funneled through one actor task; accepted sockets get a read
//! pump and a write pump that talk to the actor only through channels and a
//! captured client id.

use crate::config::ProxyConfig;
use crate::registry::{ClientHandle, ClientRegistry};
use bytes::Bytes;
use portway_proto::{ClientId, CodecError, TunnelCodec, TunnelEvent, TunnelMessage};
use portway_transport::{Transport, TransportError};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Read buffer size for the per-client read pump
const READ_BUFFER_SIZE: usize = 8192;

/// Capacity of the actor command channel
const COMMAND_CAPACITY: usize = 256;

/// Capacity of each per-client write channel
const WRITE_CAPACITY: usize = 256;

/// Capacity of the upward socket error channel
const ERROR_EVENT_CAPACITY: usize = 64;

/// Proxy engine errors surfaced to the creator
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Proxy is in state {0:?}")]
    InvalidState(ProxyState),
}

/// Lifecycle of a proxy instance. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    Initializing = 0,
    Listening = 1,
    Closing = 2,
    Closed = 3,
}

impl ProxyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProxyState::Initializing,
            1 => ProxyState::Listening,
            2 => ProxyState::Closing,
            _ => ProxyState::Closed,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ProxyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ProxyState {
        ProxyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ProxyState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Upward notification that a client socket errored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSocketError {
    pub client_id: ClientId,
    pub error: String,
}

/// Commands serialized onto the actor task
enum Command {
    Accepted(TcpStream, SocketAddr),
    Socket(SocketEvent),
    Receive(TunnelMessage),
    Close(oneshot::Sender<()>),
}

/// Events observed by per-client read pumps
enum SocketEvent {
    Data { client_id: ClientId, bytes: Bytes },
    Timeout { client_id: ClientId },
    End { client_id: ClientId },
    Error { client_id: ClientId, error: String },
    Closed { client_id: ClientId },
}

/// TCP tunnel proxy endpoint.
///
/// Constructed idle; [`start_listening`](Self::start_listening) binds the
/// local port and announces the tunnel to the peer. Dropping the proxy tears
/// the engine down without notifying the peer; call
/// [`close`](Self::close) for an orderly shutdown.
pub struct TcpProxy {
    config: ProxyConfig,
    transport: Option<Box<dyn Transport>>,
    state: Arc<StateCell>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    local_addr: Option<SocketAddr>,
    error_tx: mpsc::Sender<ClientSocketError>,
    error_rx: Option<mpsc::Receiver<ClientSocketError>>,
    actor: Option<JoinHandle<()>>,
}

impl TcpProxy {
    /// Construct a proxy. It does not listen until `start_listening`.
    pub fn new(config: ProxyConfig, transport: Box<dyn Transport>) -> Self {
        let (error_tx, error_rx) = mpsc::channel(ERROR_EVENT_CAPACITY);
        Self {
            config,
            transport: Some(transport),
            state: Arc::new(StateCell::new(ProxyState::Initializing)),
            cmd_tx: None,
            local_addr: None,
            error_tx,
            error_rx: Some(error_rx),
            actor: None,
        }
    }

    /// The tunnel id this proxy filters on
    pub fn id(&self) -> &str {
        &self.config.tunnel_id
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Take the receiver for per-client socket error notifications.
    ///
    /// Events are buffered whether or not the receiver has been taken; a
    /// slow or absent consumer never blocks the engine.
    pub fn take_socket_errors(&mut self) -> Option<mpsc::Receiver<ClientSocketError>> {
        self.error_rx.take()
    }

    /// Bind the local listener and announce the tunnel to the peer.
    ///
    /// Returns the bound port, which is the resolved port when the
    /// configuration asked for port 0. A bind failure is surfaced to the
    /// caller and announced outward as a ProxyError frame.
    pub async fn start_listening(&mut self) -> Result<u16, ProxyError> {
        if self.state.get() != ProxyState::Initializing {
            return Err(ProxyError::InvalidState(self.state.get()));
        }
        let mut transport = match self.transport.take() {
            Some(transport) => transport,
            None => return Err(ProxyError::InvalidState(self.state.get())),
        };

        let listener = match bind_listener(&self.config) {
            Ok(listener) => listener,
            Err(e) => {
                self.state.set(ProxyState::Closed);
                let announce = TunnelMessage::proxy_error(
                    &self.config.tunnel_id,
                    self.config.local_port,
                    self.config.use_ipv4,
                    self.config.remote_port,
                    e.to_string(),
                );
                if let Err(send_err) = send_message(transport.as_mut(), &announce).await {
                    warn!(
                        "Could not announce bind failure for tunnel {}: {}",
                        self.config.tunnel_id, send_err
                    );
                }
                return Err(e);
            }
        };

        let local_addr = listener.local_addr()?;

        let created = TunnelMessage::proxy_created(
            &self.config.tunnel_id,
            local_addr.port(),
            self.config.use_ipv4,
            self.config.remote_port,
        );
        if let Err(e) = send_message(transport.as_mut(), &created).await {
            self.state.set(ProxyState::Closed);
            return Err(e);
        }

        info!(
            "Tunnel proxy {} listening on {} (remote port {})",
            self.config.tunnel_id, local_addr, self.config.remote_port
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let accept_handle = tokio::spawn(accept_loop(listener, cmd_tx.clone()));

        let actor = ProxyActor {
            config: self.config.clone(),
            transport,
            registry: ClientRegistry::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            next_client_id: 1,
            state: self.state.clone(),
            error_tx: self.error_tx.clone(),
            accept_handle,
        };

        self.local_addr = Some(local_addr);
        self.state.set(ProxyState::Listening);
        self.cmd_tx = Some(cmd_tx);
        self.actor = Some(tokio::spawn(actor.run()));

        Ok(local_addr.port())
    }

    /// Hand an inbound message to the proxy, e.g. from an external
    /// demultiplexer sharing one transport among several tunnels.
    ///
    /// No-op unless the proxy is listening and the tunnel id matches.
    pub async fn receive(&self, msg: TunnelMessage) {
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(Command::Receive(msg)).await;
        }
    }

    /// Shut the proxy down: stop accepting, end every live client, announce
    /// ProxyClosed to the peer. Idempotent; returns once teardown is done.
    pub async fn close(&mut self) {
        if matches!(self.state.get(), ProxyState::Closing | ProxyState::Closed) {
            return;
        }

        let Some(cmd_tx) = self.cmd_tx.clone() else {
            // never listened; there is no listener or client to release
            if let Some(mut transport) = self.transport.take() {
                let announce = TunnelMessage::proxy_closed(&self.config.tunnel_id);
                if let Err(e) = send_message(transport.as_mut(), &announce).await {
                    debug!(
                        "Could not announce shutdown for tunnel {}: {}",
                        self.config.tunnel_id, e
                    );
                }
                let _ = transport.close().await;
            }
            self.state.set(ProxyState::Closed);
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if cmd_tx.send(Command::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        } else {
            // actor already gone (transport failure path)
            self.state.set(ProxyState::Closed);
        }
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        if let Some(actor) = &self.actor {
            actor.abort();
        }
    }
}

/// Build the listener socket the same way for both address families, with
/// SO_REUSEADDR so a port left in TIME_WAIT can be rebound immediately.
fn bind_listener(config: &ProxyConfig) -> Result<TcpListener, ProxyError> {
    let bind_addr = config.bind_addr();
    let domain = if config.use_ipv4 {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(ProxyError::Io)?;
    socket.set_reuse_address(true).map_err(ProxyError::Io)?;
    socket.bind(&bind_addr.into()).map_err(|e| ProxyError::Bind {
        address: bind_addr.ip().to_string(),
        port: bind_addr.port(),
        reason: e.to_string(),
    })?;
    socket.listen(128).map_err(ProxyError::Io)?;
    socket.set_nonblocking(true).map_err(ProxyError::Io)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(ProxyError::Io)
}

async fn send_message(
    transport: &mut dyn Transport,
    msg: &TunnelMessage,
) -> Result<(), ProxyError> {
    let frame = TunnelCodec::encode(msg)?;
    transport.send(frame).await?;
    Ok(())
}

/// Accept loop. Exits when the actor goes away or the command channel is
/// dropped; the listener is released with it.
async fn accept_loop(listener: TcpListener, cmd_tx: mpsc::Sender<Command>) {
    loop {
        tokio::select! {
            _ = cmd_tx.closed() => break,
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    if cmd_tx
                        .send(Command::Accepted(stream, peer_addr))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            },
        }
    }
}

/// Actor owning the registry, the proxy state and the transport
struct ProxyActor {
    config: ProxyConfig,
    transport: Box<dyn Transport>,
    registry: ClientRegistry,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    next_client_id: ClientId,
    state: Arc<StateCell>,
    error_tx: mpsc::Sender<ClientSocketError>,
    accept_handle: JoinHandle<()>,
}

impl ProxyActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Close(ack)) => {
                        self.shutdown(true).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(Command::Accepted(stream, peer_addr)) => {
                        if let Err(e) = self.handle_accept(stream, peer_addr).await {
                            self.fail(e).await;
                            break;
                        }
                    }
                    Some(Command::Socket(event)) => {
                        if let Err(e) = self.handle_socket_event(event).await {
                            self.fail(e).await;
                            break;
                        }
                    }
                    Some(Command::Receive(msg)) => {
                        if let Err(e) = self.handle_message(msg).await {
                            self.fail(e).await;
                            break;
                        }
                    }
                    None => break,
                },
                inbound = self.transport.recv() => match inbound {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.handle_frame(frame).await {
                            self.fail(e).await;
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Transport closed, shutting down tunnel {}", self.config.tunnel_id);
                        self.shutdown(false).await;
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Transport receive error on tunnel {}: {}",
                            self.config.tunnel_id, e
                        );
                        self.shutdown(false).await;
                        break;
                    }
                },
            }
        }
    }

    /// Transport send failed; the tunnel cannot be served any further.
    async fn fail(&mut self, e: ProxyError) {
        error!(
            "Transport send failed on tunnel {}: {}",
            self.config.tunnel_id, e
        );
        self.shutdown(false).await;
    }

    async fn handle_accept(
        &mut self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ProxyError> {
        let client_id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1);

        debug!(
            "Accepted client {} from {} on tunnel {}",
            client_id, peer_addr, self.config.tunnel_id
        );

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_CAPACITY);

        let writer = tokio::spawn(write_pump(write_half, write_rx, client_id));
        let reader = tokio::spawn(read_pump(
            read_half,
            self.cmd_tx.clone(),
            client_id,
            self.config.idle_timeout,
        ));

        let handle = ClientHandle {
            write_tx,
            peer_addr,
            reader,
            writer,
        };
        if let Err(e) = self.registry.insert(client_id, handle) {
            // only reachable after client id wrap-around
            warn!("Dropping accepted client: {}", e);
            return Ok(());
        }

        let msg = TunnelMessage::connection(&self.config.tunnel_id, client_id);
        self.send(&msg).await
    }

    async fn handle_socket_event(&mut self, event: SocketEvent) -> Result<(), ProxyError> {
        match event {
            SocketEvent::Data { client_id, bytes } => {
                if self.registry.lookup(client_id).is_none() {
                    debug!("Dropping read from detached client {}", client_id);
                    return Ok(());
                }
                let msg = TunnelMessage::data(&self.config.tunnel_id, client_id, bytes.to_vec());
                self.send(&msg).await
            }
            SocketEvent::Timeout { client_id } => {
                if self.registry.lookup(client_id).is_none() {
                    return Ok(());
                }
                debug!(
                    "Client {} idle past threshold on tunnel {}",
                    client_id, self.config.tunnel_id
                );
                self.send(&TunnelMessage::timeout(&self.config.tunnel_id, client_id))
                    .await
            }
            SocketEvent::End { client_id } => {
                if self.registry.lookup(client_id).is_none() {
                    return Ok(());
                }
                debug!("Client {} half-closed (FIN)", client_id);
                self.send(&TunnelMessage::end(&self.config.tunnel_id, client_id))
                    .await
            }
            SocketEvent::Error { client_id, error } => {
                if self.registry.lookup(client_id).is_none() {
                    return Ok(());
                }
                warn!("Client {} socket error: {}", client_id, error);
                let _ = self.error_tx.try_send(ClientSocketError {
                    client_id,
                    error: error.clone(),
                });
                self.send(&TunnelMessage::error(
                    &self.config.tunnel_id,
                    client_id,
                    error,
                ))
                .await
            }
            SocketEvent::Closed { client_id } => match self.registry.remove(client_id) {
                Some(handle) => {
                    debug!("Client {} from {} closed", client_id, handle.peer_addr);
                    handle.shutdown();
                    self.send(&TunnelMessage::close(&self.config.tunnel_id, client_id))
                        .await
                }
                // already detached; never forward close twice
                None => Ok(()),
            },
        }
    }

    async fn handle_frame(&mut self, frame: Bytes) -> Result<(), ProxyError> {
        match TunnelCodec::decode(&frame) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                debug!(
                    "Dropping malformed frame on tunnel {}: {}",
                    self.config.tunnel_id, e
                );
                Ok(())
            }
        }
    }

    async fn handle_message(&mut self, msg: TunnelMessage) -> Result<(), ProxyError> {
        if msg.tunnel_id != self.config.tunnel_id {
            debug!(
                "Ignoring frame for tunnel {} (this is {})",
                msg.tunnel_id, self.config.tunnel_id
            );
            return Ok(());
        }
        match msg.event {
            TunnelEvent::Data { client_id, data } => {
                let Some(handle) = self.registry.lookup(client_id) else {
                    // expected race between local close and in-flight peer data
                    debug!(
                        "Dropping {} inbound bytes for unknown client {}",
                        data.len(),
                        client_id
                    );
                    return Ok(());
                };
                // an empty chunk is the write pump's shutdown sentinel;
                // a zero-length write is a no-op anyway
                if data.is_empty() {
                    return Ok(());
                }
                // never await the per-client queue here: a stalled client
                // must not stall dispatch for every other client
                let backlog_full = match handle.write_tx.try_send(Bytes::from(data)) {
                    Ok(()) => false,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Write side for client {} is gone, dropping bytes", client_id);
                        false
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                };
                if backlog_full {
                    return self.evict_slow_consumer(client_id).await;
                }
                Ok(())
            }
            other => {
                debug!(
                    "Ignoring inbound event on tunnel {}: {:?}",
                    self.config.tunnel_id, other
                );
                Ok(())
            }
        }
    }

    /// A client that stopped draining its write backlog is evicted, the way
    /// an erroring socket is: Error then Close go outward, the socket is
    /// destroyed, other clients are untouched.
    async fn evict_slow_consumer(&mut self, client_id: ClientId) -> Result<(), ProxyError> {
        let Some(handle) = self.registry.remove(client_id) else {
            return Ok(());
        };
        warn!(
            "Client {} from {} is not draining its write backlog, evicting it",
            client_id, handle.peer_addr
        );
        handle.shutdown();
        handle.writer.abort();

        let error = "write backlog exceeded".to_string();
        let _ = self.error_tx.try_send(ClientSocketError {
            client_id,
            error: error.clone(),
        });
        self.send(&TunnelMessage::error(
            &self.config.tunnel_id,
            client_id,
            error,
        ))
        .await?;
        self.send(&TunnelMessage::close(&self.config.tunnel_id, client_id))
            .await
    }

    /// Release everything this proxy owns. When `announce` is set the peer
    /// is told with a final ProxyClosed frame.
    async fn shutdown(&mut self, announce: bool) {
        self.state.set(ProxyState::Closing);

        // stop accepting before anything else; queued accepts that were
        // never inserted are dropped without forwarding
        self.accept_handle.abort();
        let _ = (&mut self.accept_handle).await;

        for handle in self.registry.drain() {
            handle.shutdown();
        }

        if announce {
            let msg = TunnelMessage::proxy_closed(&self.config.tunnel_id);
            if let Err(e) = self.send(&msg).await {
                debug!(
                    "Could not announce shutdown for tunnel {}: {}",
                    self.config.tunnel_id, e
                );
            }
        }
        let _ = self.transport.close().await;

        self.state.set(ProxyState::Closed);
        info!("Tunnel proxy {} closed", self.config.tunnel_id);
    }

    async fn send(&mut self, msg: &TunnelMessage) -> Result<(), ProxyError> {
        send_message(self.transport.as_mut(), msg).await
    }
}

/// Read pump for one client socket. Emits observed socket events into the
/// actor channel; the captured client id is its only link to the engine.
async fn read_pump(
    mut read_half: OwnedReadHalf,
    cmd_tx: mpsc::Sender<Command>,
    client_id: ClientId,
    idle_timeout: Option<Duration>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, read_half.read(&mut buffer)).await {
                Ok(result) => result,
                Err(_) => {
                    if cmd_tx
                        .send(Command::Socket(SocketEvent::Timeout { client_id }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
            },
            None => read_half.read(&mut buffer).await,
        };

        match read {
            Ok(0) => {
                let _ = cmd_tx
                    .send(Command::Socket(SocketEvent::End { client_id }))
                    .await;
                break;
            }
            Ok(n) => {
                let bytes = Bytes::copy_from_slice(&buffer[..n]);
                if cmd_tx
                    .send(Command::Socket(SocketEvent::Data { client_id, bytes }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                let _ = cmd_tx
                    .send(Command::Socket(SocketEvent::Error {
                        client_id,
                        error: e.to_string(),
                    }))
                    .await;
                break;
            }
        }
    }
    let _ = cmd_tx
        .send(Command::Socket(SocketEvent::Closed { client_id }))
        .await;
}

/// Write pump for one client socket. An empty chunk is the shutdown
/// sentinel: half-close the write side and stop.
async fn write_pump(
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Bytes>,
    client_id: ClientId,
) {
    while let Some(chunk) = write_rx.recv().await {
        if chunk.is_empty() {
            let _ = write_half.shutdown().await;
            break;
        }
        if let Err(e) = write_half.write_all(&chunk).await {
            debug!("Write to client {} failed: {}", client_id, e);
            break;
        }
    }
}
