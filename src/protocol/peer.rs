//! A session with one remote peer.
//!
//! The session opens with a Hello exchange, after which the peer with the
//! smaller id decides whether the connection duplicates one already
//! established and tells the other side with a Shake. Afterwards a single
//! loop reads packets in order: requests are answered inline, responses are
//! routed to the per-channel [`SyncAgent`], and any violation ends the
//! session after a best-effort `Error` packet.

use crate::channel::Channel;
use crate::config::SyncConfig;
use crate::constants::{MAX_QUERY_LIMIT, PROTOCOL_VERSION};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use crate::protocol::packet::{decode, encode, Hello, Packet, PeerId, Shake};
use crate::protocol::Protocol;
use crate::storage::QueryPage;
use crate::sync::{PacketSender, SyncAgent};
use crate::transport::Socket;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// An established session.
pub struct Peer {
    remote_id: PeerId,
    socket: Arc<dyn Socket>,
    sync_config: SyncConfig,
    agents: Mutex<HashMap<ContentHash, Arc<SyncAgent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote_id", &self.remote_id)
            .field("agents", &self.agents.lock().len())
            .finish()
    }
}

#[async_trait]
impl PacketSender for Peer {
    async fn send_packet(&self, packet: Packet) -> Result<()> {
        trace!(peer = %self.remote_id, kind = packet.kind(), "Sending packet");
        self.socket.send(packet.to_bytes()?).await
    }
}

/// Runs the Hello/Shake exchange.
///
/// Returns `None` when the connection duplicates an existing session; the
/// caller closes it quietly.
pub(crate) async fn handshake(
    protocol: &Protocol,
    socket: &Arc<dyn Socket>,
) -> Result<Option<Arc<Peer>>> {
    let timeout = Some(protocol.config().handshake_timeout);
    let local_id = protocol.peer_id();

    socket
        .send(encode(&Hello {
            version: PROTOCOL_VERSION,
            peer_id: local_id,
        })?)
        .await?;
    let hello: Hello = decode(&socket.receive(timeout).await?)?;

    if hello.version != PROTOCOL_VERSION {
        return Err(Error::protocol(format!(
            "Protocol version mismatch: local {}, remote {}",
            PROTOCOL_VERSION, hello.version
        )));
    }
    if hello.peer_id == local_id {
        return Err(Error::protocol("Connected to self"));
    }

    let peer = Arc::new(Peer {
        remote_id: hello.peer_id,
        socket: Arc::clone(socket),
        sync_config: protocol.config().sync.clone(),
        agents: Mutex::new(HashMap::new()),
        tasks: Mutex::new(Vec::new()),
    });

    if local_id < hello.peer_id {
        let is_duplicate = !protocol.reserve_peer(&peer);
        socket.send(encode(&Shake { is_duplicate })?).await?;
        if is_duplicate {
            info!(peer = %hello.peer_id, "Dropping duplicate connection");
            return Ok(None);
        }
    } else {
        let shake: Shake = decode(&socket.receive(timeout).await?)?;
        if shake.is_duplicate {
            info!(peer = %hello.peer_id, "Remote dropped duplicate connection");
            return Ok(None);
        }
        if !protocol.reserve_peer(&peer) {
            return Err(Error::protocol(format!(
                "Duplicate peer id {}",
                hello.peer_id
            )));
        }
    }

    debug!(peer = %hello.peer_id, leader = local_id < hello.peer_id, "Handshake complete");
    Ok(Some(peer))
}

impl Peer {
    /// Remote peer id.
    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    fn agent(self: &Arc<Self>, channel: &Arc<Channel>) -> Arc<SyncAgent> {
        let mut agents = self.agents.lock();
        Arc::clone(agents.entry(*channel.id()).or_insert_with(|| {
            Arc::new(SyncAgent::new(
                Arc::clone(channel),
                Arc::clone(self) as Arc<dyn PacketSender>,
                self.sync_config.clone(),
            ))
        }))
    }

    fn existing_agent(&self, channel_id: &ContentHash) -> Option<Arc<SyncAgent>> {
        self.agents.lock().get(channel_id).cloned()
    }

    /// Starts a sync of `channel` from this peer in the background.
    ///
    /// A ban-worthy sync failure closes the session.
    pub(crate) fn spawn_sync(self: &Arc<Self>, channel: &Arc<Channel>) {
        let agent = self.agent(channel);
        let peer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match agent.synchronize().await {
                Ok(()) => {}
                Err(e) if e.is_ban_worthy() => {
                    warn!(peer = %peer.remote_id, channel = %agent.channel().id(), error = %e, "Sync violation, closing session");
                    peer.fail(&e).await;
                }
                Err(Error::Closed) => {}
                Err(e) => {
                    warn!(peer = %peer.remote_id, channel = %agent.channel().id(), error = %e, "Sync failed");
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Sends a best-effort error packet and closes the socket.
    async fn fail(&self, error: &Error) {
        if let Err(e) = self.send_packet(Packet::error(error)).await {
            trace!(peer = %self.remote_id, error = %e, "Could not deliver error packet");
        }
        self.socket.close().await;
    }

    /// Reads and dispatches packets until the session ends.
    pub(crate) async fn run(self: &Arc<Self>, protocol: &Protocol) -> Result<()> {
        for channel in protocol.channels() {
            self.spawn_sync(&channel);
        }

        loop {
            let frame = match self.socket.receive(None).await {
                Ok(frame) => frame,
                Err(Error::Closed) => {
                    debug!(peer = %self.remote_id, "Session closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let result = match Packet::from_bytes(&frame) {
                Ok(packet) => self.dispatch(protocol, packet).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_ban_worthy() => {
                    warn!(peer = %self.remote_id, error = %e, "Protocol violation, closing session");
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e @ Error::Remote(_)) => {
                    info!(peer = %self.remote_id, error = %e, "Remote ended session");
                    return Err(e);
                }
                Err(Error::Closed) => return Ok(()),
                Err(e) => warn!(peer = %self.remote_id, error = %e, "Failed to handle packet"),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, protocol: &Protocol, packet: Packet) -> Result<()> {
        trace!(peer = %self.remote_id, kind = packet.kind(), "Received packet");
        match packet {
            Packet::Error { reason } => Err(Error::Remote(reason)),
            Packet::EncryptedInvite {
                request_id,
                sealed_box,
            } => {
                protocol.resolve_invite(&request_id, sealed_box);
                Ok(())
            }
            Packet::Query {
                channel_id,
                cursor,
                is_backward,
                limit,
            } => {
                let page = match protocol.channel(&channel_id) {
                    Some(channel) => {
                        channel
                            .query(&cursor, is_backward, limit.min(MAX_QUERY_LIMIT) as usize)
                            .await?
                    }
                    None => QueryPage::default(),
                };
                self.send_packet(Packet::QueryResponse {
                    channel_id,
                    messages: page.messages,
                    forward_hash: page.forward_hash,
                    backward_hash: page.backward_hash,
                })
                .await
            }
            Packet::QueryResponse {
                channel_id,
                messages,
                forward_hash,
                backward_hash,
            } => {
                match self.existing_agent(&channel_id) {
                    Some(agent) => agent.on_query_response(QueryPage {
                        messages,
                        forward_hash,
                        backward_hash,
                    }),
                    None => warn!(peer = %self.remote_id, channel = %channel_id, "Query response for unknown sync"),
                }
                Ok(())
            }
            Packet::Bulk { channel_id, hashes } => {
                let (messages, consumed) = match protocol.channel(&channel_id) {
                    Some(channel) => channel.bulk(&hashes).await?,
                    None => (Vec::new(), hashes.len()),
                };
                self.send_packet(Packet::BulkResponse {
                    channel_id,
                    messages,
                    forward_index: consumed as u32,
                })
                .await
            }
            Packet::BulkResponse {
                channel_id,
                messages,
                forward_index,
            } => {
                match self.existing_agent(&channel_id) {
                    Some(agent) => agent.on_bulk_response(messages, forward_index),
                    None => warn!(peer = %self.remote_id, channel = %channel_id, "Bulk response for unknown sync"),
                }
                Ok(())
            }
            Packet::Notification { channel_id } => {
                if let Some(channel) = protocol.channel(&channel_id) {
                    self.spawn_sync(&channel);
                }
                Ok(())
            }
        }
    }

    /// Stops sync tasks and closes the socket.
    pub(crate) async fn close(&self) {
        let agents: Vec<Arc<SyncAgent>> = self.agents.lock().drain().map(|(_, a)| a).collect();
        for agent in agents {
            agent.close();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.socket.close().await;
    }
}
