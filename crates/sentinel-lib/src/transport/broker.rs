//! In-process message router with presence and offline backlog

use super::{Credentials, Delivery, Inbound, Link, LinkStatus, PresenceEvent, Session, Transport};
use crate::error::{Result, SentinelError};
use crate::proto::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Messages kept per offline destination (oldest evicted first)
    pub backlog_limit: usize,
    /// Inbound queue depth of each connected session
    pub mailbox_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backlog_limit: 256,
            mailbox_size: 1024,
        }
    }
}

struct Peer {
    session_id: u64,
    tx: mpsc::Sender<Inbound>,
}

/// Routes envelopes between named identities
pub struct Broker {
    config: BrokerConfig,
    credentials: DashMap<String, String>,
    peers: DashMap<String, Peer>,
    backlog: DashMap<String, VecDeque<Inbound>>,
    next_session: AtomicU64,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials: DashMap::new(),
            peers: DashMap::new(),
            backlog: DashMap::new(),
            next_session: AtomicU64::new(1),
        })
    }

    /// Allow `identity` to connect with `secret`
    pub fn add_credentials(&self, identity: impl Into<String>, secret: impl Into<String>) {
        self.credentials.insert(identity.into(), secret.into());
    }

    fn authenticate(&self, identity: &str, credentials: &Credentials) -> Result<()> {
        match self.credentials.get(identity) {
            Some(secret) if *secret == credentials.secret => Ok(()),
            Some(_) => Err(SentinelError::Auth {
                identity: identity.to_string(),
                reason: "secret mismatch".to_string(),
            }),
            None => Err(SentinelError::Auth {
                identity: identity.to_string(),
                reason: "unknown identity".to_string(),
            }),
        }
    }

    /// Authenticate and open a mailbox for `identity`.
    ///
    /// A second attach for the same identity replaces the first session.
    /// Messages queued while the identity was offline are delivered ahead
    /// of anything routed after the attach.
    pub fn attach(
        &self,
        identity: &str,
        credentials: &Credentials,
    ) -> Result<(u64, mpsc::Receiver<Inbound>)> {
        self.authenticate(identity, credentials)?;

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);

        // Routes to this identity take the same entry before queueing, so
        // none can land between the drain and the peer insert
        let mut queued = self.backlog.entry(identity.to_string()).or_default();

        // Roster of peers already online
        let online: Vec<String> = self
            .peers
            .iter()
            .filter(|p| p.key() != identity)
            .map(|p| p.key().clone())
            .collect();

        // Room for the roster and the whole backlog on top of the mailbox
        let capacity = self.config.mailbox_size.max(1) + online.len() + queued.len();
        let (tx, rx) = mpsc::channel(capacity);

        for peer in online {
            let _ = tx.try_send(Inbound::Presence(PresenceEvent::PeerOnline(peer)));
        }
        if !queued.is_empty() {
            debug!(identity = %identity, queued = queued.len(), "Delivering backlog");
        }
        while let Some(item) = queued.pop_front() {
            if let Err(e) = tx.try_send(item) {
                // Only reachable if capacity was miscounted; keep the rest
                warn!(identity = %identity, "Mailbox full while delivering backlog");
                queued.push_front(e.into_inner());
                break;
            }
        }

        let replaced = self
            .peers
            .insert(identity.to_string(), Peer { session_id, tx })
            .is_some();
        drop(queued);
        self.backlog.remove_if(identity, |_, q| q.is_empty());

        if !replaced {
            self.announce(identity, PresenceEvent::PeerOnline(identity.to_string()));
        }
        info!(identity = %identity, session_id, "Peer attached");

        Ok((session_id, rx))
    }

    /// Close the session `session_id` of `identity` if it is still current
    pub fn detach(&self, identity: &str, session_id: u64) {
        let removed = self
            .peers
            .remove_if(identity, |_, peer| peer.session_id == session_id)
            .is_some();

        if removed {
            info!(identity = %identity, session_id, "Peer detached");
            self.announce(identity, PresenceEvent::PeerOffline(identity.to_string()));
        }
    }

    /// Drop whatever session `identity` currently holds
    pub fn disconnect(&self, identity: &str) {
        let session = self.peers.get(identity).map(|p| p.session_id);
        if let Some(session_id) = session {
            self.detach(identity, session_id);
        }
    }

    pub fn is_current(&self, identity: &str, session_id: u64) -> bool {
        self.peers
            .get(identity)
            .map(|p| p.session_id == session_id)
            .unwrap_or(false)
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn online_peers(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.key().clone()).collect()
    }

    /// Messages waiting for `identity` to come online
    pub fn backlog_len(&self, identity: &str) -> usize {
        self.backlog.get(identity).map(|q| q.len()).unwrap_or(0)
    }

    /// Route an envelope.
    ///
    /// An online destination with a full mailbox makes the sender wait
    /// for room, which keeps each sender's messages in order. Offline
    /// destinations get the message queued in the backlog instead.
    pub async fn route(&self, from: &str, destination: &str, envelope: Envelope) -> Delivery {
        let mut item = Inbound::Message {
            from: from.to_string(),
            envelope,
        };

        loop {
            if let Some(tx) = self.live_mailbox(destination) {
                match tx.send(item).await {
                    Ok(()) => return Delivery::Sent,
                    // Session ended while we waited; queue for the next one
                    Err(mpsc::error::SendError(returned)) => item = returned,
                }
            }

            let mut queue = self.backlog.entry(destination.to_string()).or_default();
            if self.live_mailbox(destination).is_some() {
                // Attached meanwhile, deliver directly
                continue;
            }
            while queue.len() >= self.config.backlog_limit {
                queue.pop_front();
            }
            queue.push_back(item);
            return Delivery::Sent;
        }
    }

    /// Mailbox of `identity` if it is attached and its receiver is alive
    fn live_mailbox(&self, identity: &str) -> Option<mpsc::Sender<Inbound>> {
        self.peers
            .get(identity)
            .filter(|p| !p.tx.is_closed())
            .map(|p| p.tx.clone())
    }

    fn announce(&self, about: &str, event: PresenceEvent) {
        let targets: Vec<mpsc::Sender<Inbound>> = self
            .peers
            .iter()
            .filter(|p| p.key() != about)
            .map(|p| p.tx.clone())
            .collect();

        for tx in targets {
            let _ = tx.try_send(Inbound::Presence(event.clone()));
        }
    }
}

/// Transport for agents sharing the broker's process
#[derive(Clone)]
pub struct LocalTransport {
    broker: Arc<Broker>,
}

impl LocalTransport {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, identity: &str, credentials: &Credentials) -> Result<Session> {
        let (session_id, rx) = self.broker.attach(identity, credentials)?;
        let link = LocalLink {
            broker: self.broker.clone(),
            identity: identity.to_string(),
            session_id,
        };
        Ok(Session::new(identity, Arc::new(link), rx))
    }
}

struct LocalLink {
    broker: Arc<Broker>,
    identity: String,
    session_id: u64,
}

#[async_trait]
impl Link for LocalLink {
    async fn send(&self, destination: &str, envelope: Envelope) -> Result<Delivery> {
        if self.status() != LinkStatus::Up {
            return Ok(Delivery::Dropped);
        }
        Ok(self.broker.route(&self.identity, destination, envelope).await)
    }

    /// A local session never comes back once superseded or kicked
    fn status(&self) -> LinkStatus {
        if self.broker.is_current(&self.identity, self.session_id) {
            LinkStatus::Up
        } else {
            LinkStatus::Closed
        }
    }

    async fn close(&self) {
        self.broker.detach(&self.identity, self.session_id);
    }
}
