//! Hooks the hosting server provides to each peer.
//!
//! The peer core does not own discovery or the peer table; it consumes a
//! small surface the server wires up per connection: the local identity, the
//! (possibly changing) listen address, a channel for announcing newly
//! learned addresses, a snapshot of currently live peers, and a hook for
//! validating a remote key after the handshake.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use weft_core::{ClientIdentity, PublicKey};

use crate::error::P2pResult;
use crate::protocol::PeerAddress;

/// A live peer as seen by the server, for duplicate/self detection and
/// address gossip.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    /// The peer's node key.
    pub node_id: PublicKey,
    /// The address the peer listens on, when known.
    pub listen_addr: Option<PeerAddress>,
}

type OtherPeersFn = dyn Fn() -> Vec<PeerSummary> + Send + Sync;
type VerifyPubkeyFn = dyn Fn(&PeerAddress) -> P2pResult<()> + Send + Sync;

/// Server-side hooks consumed by the peer core.
#[derive(Clone)]
pub struct ServerHooks {
    identity: Arc<ClientIdentity>,
    // Updated concurrently by NAT traversal; readers take a snapshot.
    listen_addr: Arc<RwLock<Option<PeerAddress>>>,
    announce_tx: Option<mpsc::Sender<PeerAddress>>,
    other_peers: Arc<OtherPeersFn>,
    verify_pubkey: Arc<VerifyPubkeyFn>,
}

impl ServerHooks {
    /// Create hooks with permissive defaults: no listen address, no
    /// announce channel, no other peers, and every key accepted.
    pub fn new(identity: ClientIdentity) -> Self {
        Self {
            identity: Arc::new(identity),
            listen_addr: Arc::new(RwLock::new(None)),
            announce_tx: None,
            other_peers: Arc::new(Vec::new),
            verify_pubkey: Arc::new(|_| Ok(())),
        }
    }

    /// Set the address this server listens on.
    pub fn with_listen_addr(self, addr: PeerAddress) -> Self {
        *self.listen_addr.write().unwrap() = Some(addr);
        self
    }

    /// Set the channel newly learned peer addresses are published to.
    pub fn with_announce_channel(mut self, tx: mpsc::Sender<PeerAddress>) -> Self {
        self.announce_tx = Some(tx);
        self
    }

    /// Set the snapshot function for currently live peers.
    pub fn with_other_peers(
        mut self,
        f: impl Fn() -> Vec<PeerSummary> + Send + Sync + 'static,
    ) -> Self {
        self.other_peers = Arc::new(f);
        self
    }

    /// Set the pubkey validation hook, called once the remote identity is
    /// known.
    pub fn with_verify_pubkey(
        mut self,
        f: impl Fn(&PeerAddress) -> P2pResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.verify_pubkey = Arc::new(f);
        self
    }

    /// The local client identity.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Snapshot of the current listen address.
    pub fn our_listen_addr(&self) -> Option<PeerAddress> {
        self.listen_addr.read().unwrap().clone()
    }

    /// Update the listen address (NAT traversal may move it).
    pub fn set_listen_addr(&self, addr: Option<PeerAddress>) {
        *self.listen_addr.write().unwrap() = addr;
    }

    /// Publish a newly learned peer address. Fire-and-forget: a full or
    /// missing channel drops the address.
    pub fn announce_peer(&self, addr: PeerAddress) {
        if let Some(tx) = &self.announce_tx {
            if let Err(err) = tx.try_send(addr) {
                tracing::debug!(error = %err, "dropping peer announcement");
            }
        }
    }

    /// Snapshot of currently live peers.
    pub fn other_peers(&self) -> Vec<PeerSummary> {
        (self.other_peers)()
    }

    /// Validate a remote key/address pair.
    pub fn verify_pubkey(&self, addr: &PeerAddress) -> P2pResult<()> {
        (self.verify_pubkey)(addr)
    }
}

impl std::fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHooks")
            .field("identity", &self.identity.public_key())
            .field("listen_addr", &self.our_listen_addr())
            .finish_non_exhaustive()
    }
}
