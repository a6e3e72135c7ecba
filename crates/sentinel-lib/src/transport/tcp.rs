//! Network transport: the broker exposed over TCP
//!
//! Frames are prost-encoded [`Frame`]s with a 4-byte length prefix. A
//! client first sends `Hello` and waits for `HelloAck`; afterwards it sends
//! `Route` frames and receives `Deliver` / `Presence` frames.

use super::{
    Backoff, Broker, Credentials, Delivery, Inbound, Link, LinkStatus, PresenceEvent, Session,
    Transport,
};
use crate::error::{Result, SentinelError};
use crate::proto::{frame, Deliver, Envelope, Frame, Hello, HelloAck, Presence, Route};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Maximum encoded frame size accepted on the wire
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Deadline for the Hello / HelloAck exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

async fn send_frame(framed: &mut FramedStream, frame: Frame) -> Result<()> {
    framed
        .send(frame.encode_to_bytes())
        .await
        .map_err(|e| SentinelError::TransientNetwork(format!("write failed: {}", e)))
}

async fn next_frame(framed: &mut FramedStream) -> Result<Option<Frame>> {
    match framed.next().await {
        Some(Ok(bytes)) => Frame::decode_from(&bytes).map(Some),
        Some(Err(e)) => Err(SentinelError::TransientNetwork(format!("read failed: {}", e))),
        None => Ok(None),
    }
}

/// Accepts TCP connections and attaches them to a [`Broker`]
pub struct BrokerServer {
    broker: Arc<Broker>,
}

impl BrokerServer {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Serve until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Broker listening"),
            Err(e) => warn!(error = %e, "Broker listening on unknown address"),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let broker = self.broker.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(broker, stream).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down broker server");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream) -> Result<()> {
    let mut framed = Framed::new(stream, codec());

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut framed)).await {
        Ok(Ok(Some(Frame {
            kind: Some(frame::Kind::Hello(hello)),
        }))) => hello,
        Ok(Ok(_)) => return Err(SentinelError::validation("expected hello frame")),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(SentinelError::TransientNetwork("handshake timed out".into())),
    };

    let identity = hello.identity.clone();
    let (session_id, mut mailbox) =
        match broker.attach(&identity, &Credentials::new(hello.secret)) {
            Ok(attached) => attached,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Rejected connection");
                let nack = Frame::new(frame::Kind::HelloAck(HelloAck {
                    ok: false,
                    reason: e.to_string(),
                }));
                let _ = send_frame(&mut framed, nack).await;
                return Err(e);
            }
        };

    let ack = Frame::new(frame::Kind::HelloAck(HelloAck {
        ok: true,
        reason: String::new(),
    }));
    if let Err(e) = send_frame(&mut framed, ack).await {
        broker.detach(&identity, session_id);
        return Err(e);
    }

    let (mut sink, mut stream) = framed.split();

    let mut writer = tokio::spawn(async move {
        while let Some(item) = mailbox.recv().await {
            let frame = match item {
                Inbound::Message { from, envelope } => frame::Kind::Deliver(Deliver {
                    from,
                    envelope: Some(envelope),
                }),
                Inbound::Presence(PresenceEvent::PeerOnline(peer)) => {
                    frame::Kind::Presence(Presence { peer, online: true })
                }
                Inbound::Presence(PresenceEvent::PeerOffline(peer)) => {
                    frame::Kind::Presence(Presence { peer, online: false })
                }
            };
            if sink.send(Frame::new(frame).encode_to_bytes()).await.is_err() {
                break;
            }
        }
    });

    // The writer ends when the broker drops this session's mailbox
    // (replaced or kicked); closing the socket lets the client reconnect.
    let result = loop {
        let incoming = tokio::select! {
            incoming = stream.next() => incoming,
            _ = &mut writer => break Ok(()),
        };
        match incoming {
            Some(Ok(bytes)) => match Frame::decode_from(&bytes) {
                Ok(Frame {
                    kind: Some(frame::Kind::Route(route)),
                }) => match route.envelope {
                    Some(envelope) => {
                        broker.route(&identity, &route.destination, envelope).await;
                    }
                    None => debug!(identity = %identity, "Route frame without envelope"),
                },
                Ok(_) => debug!(identity = %identity, "Ignoring unexpected frame"),
                Err(e) => warn!(identity = %identity, error = %e, "Dropping malformed frame"),
            },
            Some(Err(e)) => {
                break Err(SentinelError::TransientNetwork(format!("read failed: {}", e)))
            }
            None => break Ok(()),
        }
    };

    writer.abort();
    broker.detach(&identity, session_id);
    result
}

/// [`LinkStatus`] shared between a session and its connection driver
#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: LinkStatus) -> Self {
        Self(AtomicU8::new(Self::encode(status)))
    }

    fn encode(status: LinkStatus) -> u8 {
        match status {
            LinkStatus::Up => 0,
            LinkStatus::Reconnecting => 1,
            LinkStatus::Closed => 2,
            LinkStatus::AuthRejected => 3,
        }
    }

    fn decode(raw: u8) -> LinkStatus {
        match raw {
            0 => LinkStatus::Up,
            1 => LinkStatus::Reconnecting,
            2 => LinkStatus::Closed,
            _ => LinkStatus::AuthRejected,
        }
    }

    fn get(&self) -> LinkStatus {
        Self::decode(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, status: LinkStatus) {
        self.0.store(Self::encode(status), Ordering::SeqCst);
    }

    /// Move to `status` unless the link already ended
    fn advance(&self, status: LinkStatus) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (!Self::decode(current).is_terminal()).then_some(Self::encode(status))
        });
    }
}

/// Configuration for [`TcpTransport`]
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Broker address, e.g. "cerebro.local:5222"
    pub addr: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub outbound_buffer: usize,
    pub inbound_buffer: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5222".to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: super::DEFAULT_BASE_BACKOFF,
            max_backoff: super::DEFAULT_MAX_BACKOFF,
            outbound_buffer: 1024,
            inbound_buffer: 1024,
        }
    }
}

/// Network client for a remote [`BrokerServer`]
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self::new(TcpTransportConfig {
            addr: addr.into(),
            ..Default::default()
        })
    }

    async fn establish(&self, identity: &str, credentials: &Credentials) -> Result<FramedStream> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| {
            SentinelError::TransientNetwork(format!("connect to {} timed out", self.config.addr))
        })??;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, codec());
        let hello = Frame::new(frame::Kind::Hello(Hello {
            identity: identity.to_string(),
            secret: credentials.secret.clone(),
        }));
        send_frame(&mut framed, hello).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut framed))
            .await
            .map_err(|_| SentinelError::TransientNetwork("handshake timed out".into()))??;

        match reply {
            Some(Frame {
                kind: Some(frame::Kind::HelloAck(ack)),
            }) if ack.ok => Ok(framed),
            Some(Frame {
                kind: Some(frame::Kind::HelloAck(ack)),
            }) => Err(SentinelError::Auth {
                identity: identity.to_string(),
                reason: ack.reason,
            }),
            Some(_) => Err(SentinelError::validation("expected hello ack")),
            None => Err(SentinelError::TransientNetwork(
                "broker closed during handshake".into(),
            )),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, identity: &str, credentials: &Credentials) -> Result<Session> {
        let framed = self.establish(identity, credentials).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_buffer);
        let status = Arc::new(StatusCell::new(LinkStatus::Up));
        let cancel = CancellationToken::new();

        let driver = ConnectionDriver {
            transport: self.clone(),
            identity: identity.to_string(),
            credentials: credentials.clone(),
            status: status.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run(framed, outbound_rx, inbound_tx));

        let link = TcpLink {
            outbound: outbound_tx,
            status,
            cancel,
        };
        Ok(Session::new(identity, Arc::new(link), inbound_rx))
    }
}

/// Owns the socket and reconnects after drops
struct ConnectionDriver {
    transport: TcpTransport,
    identity: String,
    credentials: Credentials,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
}

impl ConnectionDriver {
    async fn run(
        self,
        framed: FramedStream,
        mut outbound: mpsc::Receiver<Frame>,
        inbound: mpsc::Sender<Inbound>,
    ) {
        let mut current = Some(framed);
        let mut backoff = Backoff::new(
            self.transport.config.initial_backoff,
            self.transport.config.max_backoff,
        );

        loop {
            let framed = match current.take() {
                Some(f) => f,
                None => match self.reconnect(&mut backoff, &mut outbound).await {
                    Some(f) => f,
                    None => break,
                },
            };

            self.status.advance(LinkStatus::Up);
            backoff.reset();

            let keep_going = self.pump(framed, &mut outbound, &inbound).await;
            if !keep_going {
                break;
            }
            self.status.advance(LinkStatus::Reconnecting);
            warn!(identity = %self.identity, "Link to broker dropped, reconnecting");
        }

        // Keeps AuthRejected if that is why the driver stopped
        self.status.advance(LinkStatus::Closed);
        debug!(identity = %self.identity, status = ?self.status.get(), "Connection driver stopped");
    }

    /// Move frames until the socket fails. Returns false when the session
    /// was closed by its owner.
    async fn pump(
        &self,
        framed: FramedStream,
        outbound: &mut mpsc::Receiver<Frame>,
        inbound: &mpsc::Sender<Inbound>,
    ) -> bool {
        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return false;
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else { return false };
                    if let Err(e) = sink.send(frame.encode_to_bytes()).await {
                        debug!(error = %e, "Write to broker failed");
                        return true;
                    }
                }
                incoming = stream.next() => {
                    let bytes = match incoming {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            debug!(error = %e, "Read from broker failed");
                            return true;
                        }
                        None => return true,
                    };
                    let item = match Frame::decode_from(&bytes) {
                        Ok(Frame { kind: Some(frame::Kind::Deliver(d)) }) => match d.envelope {
                            Some(envelope) => Inbound::Message { from: d.from, envelope },
                            None => continue,
                        },
                        Ok(Frame { kind: Some(frame::Kind::Presence(p)) }) => {
                            if p.online {
                                Inbound::Presence(PresenceEvent::PeerOnline(p.peer))
                            } else {
                                Inbound::Presence(PresenceEvent::PeerOffline(p.peer))
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed frame from broker");
                            continue;
                        }
                    };
                    if inbound.send(item).await.is_err() {
                        // Nobody is listening any more; keep publishing only
                        debug!("Inbound receiver dropped");
                    }
                }
            }
        }
    }

    async fn reconnect(
        &self,
        backoff: &mut Backoff,
        outbound: &mut mpsc::Receiver<Frame>,
    ) -> Option<FramedStream> {
        loop {
            // Anything queued while the link was down is stale
            while outbound.try_recv().is_ok() {}

            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self
                .transport
                .establish(&self.identity, &self.credentials)
                .await
            {
                Ok(framed) => {
                    info!(identity = %self.identity, attempts = backoff.attempt(), "Reconnected to broker");
                    return Some(framed);
                }
                Err(e @ SentinelError::Auth { .. }) => {
                    error!(identity = %self.identity, error = %e, "Broker rejected credentials, giving up");
                    self.status.set(LinkStatus::AuthRejected);
                    return None;
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        attempts = backoff.attempt(),
                        next_backoff_ms = backoff.ceiling().as_millis() as u64,
                        "Reconnect failed"
                    );
                }
            }
        }
    }
}

struct TcpLink {
    outbound: mpsc::Sender<Frame>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&self, destination: &str, envelope: Envelope) -> Result<Delivery> {
        if self.status() != LinkStatus::Up {
            return Ok(Delivery::Dropped);
        }
        let frame = Frame::new(frame::Kind::Route(Route {
            destination: destination.to_string(),
            envelope: Some(envelope),
        }));
        self.outbound
            .send(frame)
            .await
            .map(|_| Delivery::Sent)
            .map_err(|_| SentinelError::TransientNetwork("connection driver stopped".into()))
    }

    fn status(&self) -> LinkStatus {
        self.status.get()
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.status.advance(LinkStatus::Closed);
    }
}
