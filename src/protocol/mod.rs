//! Process-wide protocol state.
//!
//! A [`Protocol`] holds the local peer id, the channels this node carries,
//! the set of connected peers (which doubles as the duplicate-connection
//! guard) and the invites it is waiting for. Every appended message in a
//! held channel is announced to all connected peers with a `Notification`,
//! which prompts them to sync.
//!
//! ## Modules
//!
//! - `packet`: wire frames and their bounds
//! - `peer`: handshake and the per-peer receive loop
//! - `invite`: invite request, payload and sealing

pub mod invite;
pub mod packet;
pub mod peer;

pub use invite::{create_request, request_id, InvitePayload, InviteRequest, InviteSecret};
pub use packet::{decode, encode, Hello, Packet, PeerId, Shake};
pub use peer::Peer;

use crate::channel::Channel;
use crate::config::ProtocolConfig;
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::storage::StorageBackend;
use crate::sync::PacketSender;
use crate::transport::Socket;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A node's protocol instance.
pub struct Protocol {
    peer_id: PeerId,
    config: ProtocolConfig,
    backend: Arc<dyn StorageBackend>,
    channels: RwLock<HashMap<ContentHash, Arc<Channel>>>,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    invites: Mutex<HashMap<[u8; 32], oneshot::Sender<Vec<u8>>>>,
    fanout: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("peer_id", &self.peer_id)
            .field("channels", &self.channels.read().len())
            .field("peers", &self.peers.lock().len())
            .finish()
    }
}

impl Protocol {
    /// Creates a protocol instance with a fresh peer id.
    pub fn new(backend: Arc<dyn StorageBackend>, config: ProtocolConfig) -> Arc<Self> {
        let peer_id = PeerId::random();
        info!(peer_id = %peer_id, "Protocol started");
        Arc::new(Self {
            peer_id,
            config,
            backend,
            channels: RwLock::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            invites: Mutex::new(HashMap::new()),
            fanout: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Local peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Active configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Storage shared by every channel of this node.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Looks up a held channel.
    pub fn channel(&self, channel_id: &ContentHash) -> Option<Arc<Channel>> {
        self.channels.read().get(channel_id).cloned()
    }

    /// Looks up a held channel by name.
    pub fn channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .values()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// All held channels.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Starts carrying `channel`: announces its new messages to peers and
    /// syncs it with everyone connected.
    pub fn add_channel(self: &Arc<Self>, channel: Arc<Channel>) -> Result<()> {
        self.ensure_open()?;
        {
            let mut channels = self.channels.write();
            if channels.contains_key(channel.id()) {
                return Err(Error::ChannelExists(channel.id().to_hex()));
            }
            if channels.values().any(|c| c.name() == channel.name()) {
                return Err(Error::ChannelExists(channel.name().to_string()));
            }
            channels.insert(*channel.id(), Arc::clone(&channel));
        }

        let handle = tokio::spawn(announce(
            Arc::downgrade(self),
            *channel.id(),
            channel.subscribe(),
        ));
        self.fanout.lock().push(handle);

        let peers: Vec<Arc<Peer>> = self.peers.lock().values().cloned().collect();
        for peer in peers {
            peer.spawn_sync(&channel);
        }
        info!(channel = %channel.id(), name = channel.name(), "Carrying channel");
        Ok(())
    }

    /// Posts to a held channel.
    pub async fn post(
        &self,
        channel_id: &ContentHash,
        body: &serde_json::Value,
        author: &Identity,
    ) -> Result<ContentHash> {
        let channel = self
            .channel(channel_id)
            .ok_or_else(|| Error::ChannelNotFound(channel_id.to_hex()))?;
        channel.post(body, author).await
    }

    async fn broadcast(&self, packet: Packet) {
        let peers: Vec<Arc<Peer>> = self.peers.lock().values().cloned().collect();
        for peer in peers {
            if let Err(e) = peer.send_packet(packet.clone()).await {
                debug!(peer = %peer.remote_id(), error = %e, "Failed to notify peer");
            }
        }
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Ids of connected peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.lock().keys().copied().collect()
    }

    /// Claims `peer`'s id. Returns `false` if a session with that id exists.
    pub(crate) fn reserve_peer(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains_key(&peer.remote_id()) {
            return false;
        }
        peers.insert(peer.remote_id(), Arc::clone(peer));
        true
    }

    fn release_peer(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.lock();
        if peers
            .get(&peer.remote_id())
            .is_some_and(|held| Arc::ptr_eq(held, peer))
        {
            peers.remove(&peer.remote_id());
        }
    }

    /// Runs a session over `socket` until either side closes it.
    ///
    /// A duplicate connection is closed quietly and returns `Ok`. Violations
    /// by the remote return the ban-worthy error after the socket is closed.
    pub async fn connect(self: &Arc<Self>, socket: Arc<dyn Socket>) -> Result<()> {
        if let Err(e) = self.ensure_open() {
            socket.close().await;
            return Err(e);
        }

        let peer = match peer::handshake(self, &socket).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                socket.close().await;
                return Ok(());
            }
            Err(e) => {
                if e.is_ban_worthy() {
                    warn!(error = %e, "Handshake failed");
                    if let Ok(frame) = Packet::error(&e).to_bytes() {
                        let _ = socket.send(frame).await;
                    }
                } else {
                    debug!(error = %e, "Handshake aborted");
                }
                socket.close().await;
                return Err(e);
            }
        };

        info!(peer = %peer.remote_id(), "Peer connected");
        let result = peer.run(self).await;
        self.release_peer(&peer);
        peer.close().await;
        info!(peer = %peer.remote_id(), "Peer disconnected");
        result
    }

    // =========================================================================
    // Invites
    // =========================================================================

    /// Creates an invite request for `identity` addressed to this node.
    pub fn request_invite(&self, identity: &Identity) -> Result<(InviteRequest, InviteSecret)> {
        create_request(self.peer_id, identity)
    }

    /// Delegates posting rights in `channel_id` to the requester and sends
    /// the sealed invite to the requesting peer.
    pub async fn invite(
        &self,
        channel_id: &ContentHash,
        member: &Identity,
        request: &InviteRequest,
        display_name: &str,
    ) -> Result<()> {
        let channel = self
            .channel(channel_id)
            .ok_or_else(|| Error::ChannelNotFound(channel_id.to_hex()))?;
        let peer = self
            .peers
            .lock()
            .get(&request.peer_id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(request.peer_id.to_hex()))?;

        let payload = InvitePayload::issue(
            member,
            channel.name(),
            channel.public_key(),
            request,
            display_name,
        )?;
        let sealed_box = payload.seal(&request.box_public_key)?;
        peer.send_packet(Packet::EncryptedInvite {
            request_id: request.request_id()?,
            sealed_box,
        })
        .await?;

        info!(channel = %channel_id, peer = %request.peer_id, trustee = display_name, "Sent invite");
        Ok(())
    }

    /// Waits for the invite answering `secret`, then joins the channel and
    /// stores the delegated chain in `identity`.
    pub async fn accept_invite(
        self: &Arc<Self>,
        identity: &Identity,
        secret: InviteSecret,
        timeout: Duration,
    ) -> Result<Arc<Channel>> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.invites.lock().insert(*secret.request_id(), tx);

        let sealed_box = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(sealed_box)) => sealed_box,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                self.invites.lock().remove(secret.request_id());
                return Err(Error::Timeout);
            }
        };

        let payload = secret.open(&sealed_box)?;
        let channel_id = payload.channel_id();
        identity.add_chain(&channel_id, &payload.channel_public_key, payload.chain.clone())?;

        if let Some(channel) = self.channel(&channel_id) {
            return Ok(channel);
        }
        let channel = Arc::new(
            Channel::from_public_key(
                &payload.channel_name,
                payload.channel_public_key,
                Arc::clone(&self.backend),
                self.config.cache_capacity,
            )
            .await?,
        );
        self.add_channel(Arc::clone(&channel))?;
        info!(channel = %channel_id, name = channel.name(), "Joined channel by invite");
        Ok(channel)
    }

    pub(crate) fn resolve_invite(&self, request_id: &[u8; 32], sealed_box: Vec<u8>) {
        match self.invites.lock().remove(request_id) {
            Some(waiter) => {
                let _ = waiter.send(sealed_box);
            }
            None => debug!(
                request_id = %hex::encode(&request_id[..8]),
                "Ignoring invite nobody is waiting for"
            ),
        }
    }

    /// Stops announcements, ends every session and fails pending invite
    /// waits with [`Error::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.fanout.lock().drain(..) {
            task.abort();
        }
        let peers: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close().await;
        }
        self.invites.lock().clear();
        info!(peer_id = %self.peer_id, "Protocol closed");
    }
}

/// Forwards a channel's append events to every connected peer.
async fn announce(
    protocol: Weak<Protocol>,
    channel_id: ContentHash,
    mut events: broadcast::Receiver<ContentHash>,
) {
    loop {
        match events.recv().await {
            Ok(hash) => trace!(channel = %channel_id, hash = %hash, "Announcing message"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(channel = %channel_id, skipped, "Announcer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
        let Some(protocol) = protocol.upgrade() else {
            return;
        };
        protocol
            .broadcast(Packet::Notification { channel_id })
            .await;
    }
}
