//! Node bus: point-to-point envelope delivery between named endpoints
//!
//! Every coordinator, heartbeat observer and instance proxy owns a named
//! endpoint. Delivery is local-first through per-endpoint queues; addresses
//! on another node go through a remote link, either a paired in-process bus
//! (tests, single-binary deployments) or a length-delimited TCP link.
//! Sends to unknown endpoints are dropped with a warning: reliability is the
//! sender's concern (registration retries, heartbeat timeouts).

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::domain_types::EndpointAddress;
use crate::messages::Envelope;

/// An envelope together with its destination endpoint name, as carried by
/// remote links.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AddressedEnvelope {
    pub to: String,
    pub envelope: Envelope,
}

/// A transport to another node's bus.
pub trait RemoteLink: Send + Sync {
    fn send(&self, to: &str, envelope: Envelope);
}

/// Per-node envelope router.
pub struct NodeBus {
    url: String,
    local: DashMap<String, mpsc::UnboundedSender<Envelope>>,
    links: DashMap<String, Arc<dyn RemoteLink>>,
    exit_watchers: DashMap<String, Vec<oneshot::Sender<()>>>,
}

impl NodeBus {
    /// Creates a bus for the node reachable at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            local: DashMap::new(),
            links: DashMap::new(),
            exit_watchers: DashMap::new(),
        })
    }

    /// The transport URL other nodes address this bus by.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The address of a named endpoint on this bus.
    #[must_use]
    pub fn address_of(&self, name: &str) -> EndpointAddress {
        EndpointAddress::new(name, self.url.clone())
    }

    /// Registers a named endpoint and returns its mailbox.
    ///
    /// Re-registering a name replaces the previous mailbox; the old receiver
    /// observes channel closure.
    pub fn register_endpoint(&self, name: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local.insert(name.to_string(), tx);
        debug!(endpoint = name, url = %self.url, "endpoint registered on bus");
        rx
    }

    /// Removes an endpoint and fires its lifecycle watchers.
    pub fn unregister_endpoint(&self, name: &str) {
        self.local.remove(name);
        if let Some((_, watchers)) = self.exit_watchers.remove(name) {
            for watcher in watchers {
                let _ = watcher.send(());
            }
        }
        debug!(endpoint = name, url = %self.url, "endpoint unregistered from bus");
    }

    /// Resolves once the named endpoint unregisters.
    ///
    /// Used by heartbeat observers to distinguish a clean exit from a
    /// timeout.
    pub fn watch_exit(&self, name: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.exit_watchers.entry(name.to_string()).or_default().push(tx);
        rx
    }

    /// Delivers an envelope to the endpoint at `to`.
    pub fn send(&self, to: &EndpointAddress, envelope: Envelope) {
        if to.url == self.url || to.url.is_empty() {
            self.deliver_local(&to.name, envelope);
            return;
        }
        if let Some(link) = self.links.get(&to.url) {
            link.send(&to.name, envelope);
            return;
        }
        warn!(%to, "no route to endpoint, dropping envelope");
    }

    fn deliver_local(&self, name: &str, envelope: Envelope) {
        match self.local.get(name) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    warn!(endpoint = name, "endpoint mailbox closed, dropping envelope");
                }
            }
            None => warn!(endpoint = name, "unknown endpoint, dropping envelope"),
        }
    }

    /// Installs a remote link for envelopes addressed to `url`.
    pub fn add_link(&self, url: impl Into<String>, link: Arc<dyn RemoteLink>) {
        self.links.insert(url.into(), link);
    }

    /// Pairs two in-process buses so each can address the other by URL.
    pub fn link_pair(a: &Arc<Self>, b: &Arc<Self>) {
        a.add_link(b.url.clone(), Arc::new(LocalLink(Arc::clone(b))));
        b.add_link(a.url.clone(), Arc::new(LocalLink(Arc::clone(a))));
    }

    /// Accepts framed envelope connections from remote buses.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    return;
                };
                debug!(%peer, url = %bus.url, "bus accepted remote link");
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        match serde_json::from_slice::<AddressedEnvelope>(&frame) {
                            Ok(addressed) => {
                                bus.deliver_local(&addressed.to, addressed.envelope);
                            }
                            Err(error) => {
                                warn!(%error, "undecodable bus frame, dropping");
                            }
                        }
                    }
                });
            }
        })
    }

    /// Connects a TCP link to the bus serving at `url`.
    pub async fn connect_link(&self, url: &str) -> std::io::Result<()> {
        let socket = TcpStream::connect(url).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<AddressedEnvelope>();
        tokio::spawn(async move {
            let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
            while let Some(addressed) = rx.recv().await {
                let Ok(bytes) = serde_json::to_vec(&addressed) else {
                    continue;
                };
                if framed.send(Bytes::from(bytes)).await.is_err() {
                    warn!("bus link write failed, remote side gone");
                    return;
                }
            }
        });
        self.add_link(url, Arc::new(TcpLink { tx }));
        Ok(())
    }
}

/// Link between two buses in the same process.
struct LocalLink(Arc<NodeBus>);

impl RemoteLink for LocalLink {
    fn send(&self, to: &str, envelope: Envelope) {
        self.0.deliver_local(to, envelope);
    }
}

/// Link to a bus on another node over framed TCP.
struct TcpLink {
    tx: mpsc::UnboundedSender<AddressedEnvelope>,
}

impl RemoteLink for TcpLink {
    fn send(&self, to: &str, envelope: Envelope) {
        let addressed = AddressedEnvelope {
            to: to.to_string(),
            envelope,
        };
        if self.tx.send(addressed).is_err() {
            warn!(endpoint = to, "bus link closed, dropping envelope");
        }
    }
}
