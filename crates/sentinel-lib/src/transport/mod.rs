//! Addressed messaging between agents
//!
//! This module provides:
//! - A [`Broker`] routing envelopes between named identities with presence
//!   and a bounded server-side backlog for offline destinations
//! - [`LocalTransport`] for agents living in the broker's process
//! - [`TcpTransport`] / [`BrokerServer`] for agents on other hosts, with
//!   transparent reconnection
//! - [`Session::subscribe`] which preserves per-sender order while handling
//!   different senders concurrently

mod backoff;
mod broker;
mod tcp;


pub use backoff::{Backoff, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF};
pub use broker::{Broker, BrokerConfig, LocalTransport};
pub use tcp::{BrokerServer, TcpTransport, TcpTransportConfig};

use crate::error::{Result, SentinelError};
use crate::proto::{Envelope, Payload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default deadline for a single publish
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue depth of each per-sender dispatch queue
const SENDER_QUEUE_SIZE: usize = 1024;

/// Shared-secret credentials presented on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub secret: String,
}

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

/// Peer availability change announced by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    PeerOnline(String),
    PeerOffline(String),
}

/// Item received on a session
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message { from: String, envelope: Envelope },
    Presence(PresenceEvent),
}

/// Health of the link under a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    /// Dropped; the transport is re-establishing it on its own
    Reconnecting,
    /// Ended for good (closed, superseded or kicked); open a new session
    Closed,
    /// The broker refused the credentials while re-establishing the link
    AuthRejected,
}

impl LinkStatus {
    /// No further traffic will flow on this session
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Closed | LinkStatus::AuthRejected)
    }
}

/// Outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the transport
    Sent,
    /// Discarded because the link was down; the next poll supersedes it
    Dropped,
}

/// One authenticated connection to the broker
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, destination: &str, envelope: Envelope) -> Result<Delivery>;

    fn status(&self) -> LinkStatus;

    async fn close(&self);
}

/// Factory for sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fails with `Auth` on rejected credentials and `TransientNetwork`
    /// when the broker cannot be reached.
    async fn connect(&self, identity: &str, credentials: &Credentials) -> Result<Session>;
}

/// Receiver of inbound traffic for [`Session::subscribe`]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: &str, envelope: Envelope);

    async fn on_presence(&self, event: PresenceEvent);
}

/// Connected messaging session for one identity
pub struct Session {
    identity: String,
    link: Arc<dyn Link>,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    publish_timeout: Duration,
}

impl Session {
    pub fn new(
        identity: impl Into<String>,
        link: Arc<dyn Link>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        Self {
            identity: identity.into(),
            link,
            inbound: Mutex::new(Some(inbound)),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Up
    }

    /// Fire-and-forget publish of a payload to `destination`
    pub async fn publish(&self, destination: &str, payload: Payload) -> Result<Delivery> {
        let envelope = payload.into_envelope(&self.identity);
        match tokio::time::timeout(self.publish_timeout, self.link.send(destination, envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SentinelError::TransientNetwork(format!(
                "publish to {} timed out after {:?}",
                destination, self.publish_timeout
            ))),
        }
    }

    /// Take the raw inbound stream. Returns `None` once taken.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Dispatch inbound traffic to `handler` until the session ends.
    ///
    /// Messages from one sender are handled in arrival order; different
    /// senders are handled concurrently.
    pub fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<JoinHandle<()>> {
        let inbound = self
            .take_inbound()
            .ok_or_else(|| SentinelError::validation("session already subscribed"))?;
        Ok(tokio::spawn(dispatch(inbound, handler)))
    }

    pub async fn close(&self) {
        self.link.close().await;
    }
}

async fn dispatch(mut inbound: mpsc::Receiver<Inbound>, handler: Arc<dyn MessageHandler>) {
    let mut queues: HashMap<String, mpsc::Sender<Envelope>> = HashMap::new();

    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Message { from, envelope } => {
                let queue = queues
                    .entry(from.clone())
                    .or_insert_with(|| spawn_sender_queue(from.clone(), handler.clone()));

                if let Err(e) = queue.send(envelope).await {
                    // The sender task only exits if the handler panicked
                    warn!(from = %from, "Sender queue closed, recreating");
                    let fresh = spawn_sender_queue(from.clone(), handler.clone());
                    let _ = fresh.send(e.0).await;
                    queues.insert(from, fresh);
                }
            }
            Inbound::Presence(event) => handler.on_presence(event).await,
        }
    }

    debug!("Inbound stream ended, stopping dispatch");
}

fn spawn_sender_queue(from: String, handler: Arc<dyn MessageHandler>) -> mpsc::Sender<Envelope> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(SENDER_QUEUE_SIZE);
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            handler.on_message(&from, envelope).await;
        }
    });
    tx
}
