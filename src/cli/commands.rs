//! Command implementations for the dagchat CLI.

use crate::channel::Channel;
use crate::cli::utils::{
    format_timestamp, has_identity, is_initialized, load_identity, open_backend, save_identity,
    NodeConfig,
};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{InviteRequest, PeerId, Protocol};
use crate::storage::StorageBackend;
use crate::transport::TcpSocket;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

fn require_initialized(config: &NodeConfig) -> Result<()> {
    if !is_initialized(&config.data_dir) {
        return Err(Error::config(format!(
            "{} is not a dagchat data directory, run `dagchat init <name>` first",
            config.data_dir.display()
        )));
    }
    Ok(())
}

async fn find_channel(
    config: &NodeConfig,
    backend: &Arc<dyn StorageBackend>,
    name: &str,
) -> Result<Channel> {
    Channel::load_all(Arc::clone(backend), config.protocol.cache_capacity)
        .await?
        .into_iter()
        .find(|c| c.name() == name)
        .ok_or_else(|| Error::ChannelNotFound(name.to_string()))
}

/// Execute init command
pub async fn init(config: &NodeConfig, name: &str) -> Result<()> {
    let backend = open_backend(config)?;
    if has_identity(&*backend).await? {
        return Err(Error::config(format!(
            "{} already holds an identity",
            config.data_dir.display()
        )));
    }

    let identity = Identity::generate(name)?;
    save_identity(&*backend, &identity).await?;

    info!(
        name = identity.name(),
        fingerprint = %hex::encode(&identity.public_key().fingerprint()[..8]),
        data_dir = %config.data_dir.display(),
        "✅ Created identity"
    );
    Ok(())
}

/// Execute create command
pub async fn create(config: &NodeConfig, name: &str) -> Result<()> {
    require_initialized(config)?;
    let backend = open_backend(config)?;
    let identity = load_identity(&*backend).await?;

    if find_channel(config, &backend, name).await.is_ok() {
        return Err(Error::ChannelExists(name.to_string()));
    }
    let channel =
        Channel::from_identity(&identity, name, backend, config.protocol.cache_capacity).await?;

    info!(name = channel.name(), id = %channel.id().to_hex(), "✅ Created channel");
    Ok(())
}

/// Execute channels command
pub async fn channels(config: &NodeConfig) -> Result<()> {
    require_initialized(config)?;
    let backend = open_backend(config)?;
    let identity = load_identity(&*backend).await?;

    let channels = Channel::load_all(backend, config.protocol.cache_capacity).await?;
    if channels.is_empty() {
        info!("No channels held");
        return Ok(());
    }

    for channel in &channels {
        let chain = identity.chain(channel.id(), channel.public_key());
        let line = serde_json::json!({
            "name": channel.name(),
            "id": channel.id().to_hex(),
            "messages": channel.message_count().await?,
            "root": channel.root_hash().map(|h| h.to_hex()),
            "can_post": chain.is_some(),
            "chain_length": chain.map(|c| c.len()),
        });
        println!("{}", line);
    }
    Ok(())
}

/// Execute post command
pub async fn post(config: &NodeConfig, channel_name: &str, body: &str) -> Result<()> {
    require_initialized(config)?;
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::validation(format!("Body is not valid JSON: {}", e)))?;

    let backend = open_backend(config)?;
    let identity = load_identity(&*backend).await?;
    let channel = find_channel(config, &backend, channel_name).await?;

    let hash = channel.post(&value, &identity).await?;
    info!(channel = channel.name(), hash = %hash, "✅ Posted message");
    Ok(())
}

/// Execute read command
pub async fn read(config: &NodeConfig, channel_name: &str, limit: usize) -> Result<()> {
    require_initialized(config)?;
    let backend = open_backend(config)?;
    let channel = find_channel(config, &backend, channel_name).await?;

    let messages = channel.messages_ordered().await?;
    let skip = messages.len().saturating_sub(limit);
    for (hash, message) in messages.into_iter().skip(skip) {
        let Some(body) = message.body().to_value()? else {
            continue;
        };
        let line = serde_json::json!({
            "hash": hash.to_hex(),
            "height": message.height(),
            "time": format_timestamp(message.timestamp()),
            "author": message.author_name().unwrap_or(channel.name()),
            "body": body,
        });
        println!("{}", line);
    }
    Ok(())
}

async fn dial(protocol: Arc<Protocol>, addr: SocketAddr) {
    let socket = match TcpSocket::connect(addr).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(peer = %addr, error = %e, "Failed to connect");
            return;
        }
    };
    if let Err(e) = protocol.connect(Arc::new(socket)).await {
        warn!(peer = %addr, error = %e, "Session ended with error");
    }
}

/// A protocol holding every channel stored in `backend`.
async fn load_protocol(
    config: &NodeConfig,
    backend: &Arc<dyn StorageBackend>,
) -> Result<Arc<Protocol>> {
    let protocol = Protocol::new(Arc::clone(backend), config.protocol.clone());
    for channel in Channel::load_all(Arc::clone(backend), config.protocol.cache_capacity).await? {
        protocol.add_channel(Arc::new(channel))?;
    }
    Ok(protocol)
}

/// Runs a session for every accepted connection. Never returns.
async fn accept_peers(listener: TcpListener, protocol: Arc<Protocol>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let socket = match TcpSocket::from_stream(stream) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(peer = %addr, error = %e, "Dropping connection");
                continue;
            }
        };
        let protocol = Arc::clone(&protocol);
        tokio::spawn(async move {
            if let Err(e) = protocol.connect(Arc::new(socket)).await {
                warn!(peer = %addr, error = %e, "Session ended with error");
            }
        });
    }
}

/// Waits until a session with `peer_id` is established.
async fn wait_for_peer(protocol: &Protocol, peer_id: &PeerId, timeout: Duration) -> Result<()> {
    let connected = tokio::time::timeout(timeout, async {
        while !protocol.connected_peers().contains(peer_id) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    connected.map_err(|_| Error::PeerNotFound(peer_id.to_hex()))
}

/// Execute serve command
pub async fn serve(config: &NodeConfig, bind: SocketAddr, peers: &[SocketAddr]) -> Result<()> {
    require_initialized(config)?;
    let backend = open_backend(config)?;
    let identity = load_identity(&*backend).await?;
    let protocol = load_protocol(config, &backend).await?;

    let listener = TcpListener::bind(bind).await?;
    info!(
        identity = identity.name(),
        addr = %listener.local_addr()?,
        channels = protocol.channels().len(),
        "Serving"
    );

    for &addr in peers {
        tokio::spawn(dial(Arc::clone(&protocol), addr));
    }

    tokio::select! {
        _ = accept_peers(listener, Arc::clone(&protocol)) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    protocol.close().await;
    Ok(())
}

/// Execute join command
///
/// Prints an invite request on stdout and accepts peers until a member
/// connects and delivers the matching invite.
pub async fn join(config: &NodeConfig, bind: SocketAddr, timeout: Duration) -> Result<()> {
    require_initialized(config)?;
    let backend = open_backend(config)?;
    let identity = load_identity(&*backend).await?;
    let protocol = load_protocol(config, &backend).await?;

    let listener = TcpListener::bind(bind).await?;
    let (request, secret) = protocol.request_invite(&identity)?;
    info!(
        addr = %listener.local_addr()?,
        timeout_secs = timeout.as_secs(),
        "Waiting for an invite, hand the request below to a channel member"
    );
    println!("{}", request.to_hex()?);

    let joined = tokio::select! {
        joined = protocol.accept_invite(&identity, secret, timeout) => joined,
        _ = accept_peers(listener, Arc::clone(&protocol)) => Err(Error::Closed),
        _ = tokio::signal::ctrl_c() => Err(Error::Closed),
    };

    let result = async {
        let channel = joined?;
        save_identity(&*backend, &identity).await?;
        let line = serde_json::json!({
            "name": channel.name(),
            "id": channel.id().to_hex(),
            "chain_length": identity.chain(channel.id(), channel.public_key()).map(|c| c.len()),
        });
        println!("{}", line);
        info!(name = channel.name(), "✅ Joined channel, run `serve` to fetch its history");
        Ok::<(), Error>(())
    }
    .await;

    protocol.close().await;
    result
}

/// Execute invite command
pub async fn invite(
    config: &NodeConfig,
    channel_name: &str,
    request_hex: &str,
    display_name: &str,
    peer: SocketAddr,
) -> Result<()> {
    require_initialized(config)?;
    let request = InviteRequest::from_hex(request_hex)?;
    let backend = open_backend(config)?;
    let identity = load_identity(&*backend).await?;
    let protocol = load_protocol(config, &backend).await?;
    let channel = protocol
        .channels()
        .into_iter()
        .find(|c| c.name() == channel_name)
        .ok_or_else(|| Error::ChannelNotFound(channel_name.to_string()))?;

    let socket = TcpSocket::connect(peer).await?;
    let session = tokio::spawn({
        let protocol = Arc::clone(&protocol);
        async move { protocol.connect(Arc::new(socket)).await }
    });

    let result = async {
        wait_for_peer(&protocol, &request.peer_id, config.protocol.handshake_timeout).await?;
        protocol
            .invite(channel.id(), &identity, &request, display_name)
            .await
    }
    .await;

    protocol.close().await;
    match session.await {
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Session ended with error"),
        Err(e) => debug!(peer = %peer, error = %e, "Session task failed"),
        Ok(Ok(())) => {}
    }
    result?;

    info!(channel = channel.name(), trustee = display_name, "✅ Sent invite");
    Ok(())
}
