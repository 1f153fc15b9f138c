//! Pull-based synchronization of one channel from one remote peer.
//!
//! A [`SyncAgent`] walks the remote DAG with `Query` pages in (height, hash)
//! order and fetches unknown bodies with `Bulk` requests. A partial pass
//! starts at the lowest local leaf; messages whose ancestors are missing are
//! parked in an unresolved map while the agent walks backward until their
//! parents turn up. If that map grows too large, or the backward walk runs
//! out, the pass restarts as a full sync from the root. A full walk only
//! moves forward: a message whose parent sorts after it (a parent excluded
//! from its height) stays pending until that parent's page arrives, and the
//! walk fails if anything is still pending when the remote DAG ends.
//!
//! Responses are delivered by the peer session through
//! [`SyncAgent::on_query_response`] and [`SyncAgent::on_bulk_response`]; at
//! most one request is outstanding per agent.

use crate::channel::{Channel, EncryptedMessage};
use crate::config::SyncConfig;
use crate::dag::{compute_partial_dag, ContentHash};
use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::storage::{Cursor, QueryPage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Outbound half of a peer session, as seen by a sync agent.
#[async_trait]
pub trait PacketSender: Send + Sync {
    /// Sends a packet to the remote peer.
    async fn send_packet(&self, packet: Packet) -> Result<()>;
}

/// Single-flight state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No pass running.
    Idle,
    /// A pass is running.
    Active,
    /// A pass is running and another was requested meanwhile.
    Pending,
}

enum PassOutcome {
    Done,
    Escalate(&'static str),
}

type BulkReply = (Vec<EncryptedMessage>, u32);

/// Synchronizes one channel from one remote peer.
pub struct SyncAgent {
    channel: Arc<Channel>,
    sender: Arc<dyn PacketSender>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    pending_query: Mutex<Option<oneshot::Sender<QueryPage>>>,
    pending_bulk: Mutex<Option<oneshot::Sender<BulkReply>>>,
    closed: AtomicBool,
}

impl fmt::Debug for SyncAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncAgent")
            .field("channel", self.channel.id())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SyncAgent {
    /// Creates an idle agent.
    pub fn new(channel: Arc<Channel>, sender: Arc<dyn PacketSender>, config: SyncConfig) -> Self {
        Self {
            channel,
            sender,
            config,
            state: Mutex::new(SyncState::Idle),
            pending_query: Mutex::new(None),
            pending_bulk: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The channel being synchronized.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Current single-flight state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Runs sync passes until no further pass was requested.
    ///
    /// Returns immediately if a pass is already running; that pass will run
    /// once more before finishing.
    pub async fn synchronize(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SyncState::Idle => *state = SyncState::Active,
                SyncState::Active | SyncState::Pending => {
                    *state = SyncState::Pending;
                    trace!(channel = %self.channel.id(), "Sync already running, marked pending");
                    return Ok(());
                }
            }
        }

        loop {
            let result = self.run_pass().await;
            let mut state = self.state.lock();
            if let Err(e) = result {
                *state = SyncState::Idle;
                return Err(e);
            }
            if *state == SyncState::Pending {
                *state = SyncState::Active;
                continue;
            }
            *state = SyncState::Idle;
            return Ok(());
        }
    }

    /// Delivers a query response. Unsolicited responses are dropped.
    pub fn on_query_response(&self, page: QueryPage) {
        match self.pending_query.lock().take() {
            Some(slot) => {
                let _ = slot.send(page);
            }
            None => warn!(channel = %self.channel.id(), "Dropping unsolicited query response"),
        }
    }

    /// Delivers a bulk response. Unsolicited responses are dropped.
    pub fn on_bulk_response(&self, messages: Vec<EncryptedMessage>, forward_index: u32) {
        match self.pending_bulk.lock().take() {
            Some(slot) => {
                let _ = slot.send((messages, forward_index));
            }
            None => warn!(channel = %self.channel.id(), "Dropping unsolicited bulk response"),
        }
    }

    /// Fails outstanding and future requests with [`Error::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending_query.lock().take();
        self.pending_bulk.lock().take();
    }

    // =========================================================================
    // Pass
    // =========================================================================

    async fn run_pass(&self) -> Result<()> {
        if self.channel.leaves().await?.is_empty() {
            return self.full_sync().await;
        }
        match self.walk(false).await? {
            PassOutcome::Done => Ok(()),
            PassOutcome::Escalate(reason) => {
                info!(channel = %self.channel.id(), reason, "Escalating to full sync");
                self.full_sync().await
            }
        }
    }

    async fn full_sync(&self) -> Result<()> {
        match self.walk(true).await? {
            PassOutcome::Done => Ok(()),
            PassOutcome::Escalate(reason) => Err(Error::sync_failed(reason)),
        }
    }

    async fn start_cursor(&self, full: bool) -> Result<Cursor> {
        if full {
            return Ok(match self.channel.root_hash() {
                Some(root) => Cursor::Hash(root),
                None => Cursor::Height(0),
            });
        }
        let leaves = self.channel.leaves().await?;
        let mut min_height = u64::MAX;
        for leaf in &leaves {
            if let Some(message) = self.channel.get_message(leaf).await? {
                min_height = min_height.min(message.height());
            }
        }
        Ok(Cursor::Height(if min_height == u64::MAX { 0 } else { min_height }))
    }

    /// One walk over the remote DAG. A full walk never escalates; an
    /// exhausted walk with pending messages comes back as `Escalate` and is
    /// turned into an error by the caller.
    async fn walk(&self, full: bool) -> Result<PassOutcome> {
        let mut cursor = Some(self.start_cursor(full).await?);
        let mut backward = false;
        let mut resume: Option<Cursor> = None;
        let mut unresolved: HashMap<ContentHash, Vec<ContentHash>> = HashMap::new();

        debug!(
            channel = %self.channel.id(),
            full,
            start = ?cursor,
            "Starting sync walk"
        );

        while let Some(current) = cursor.take() {
            let page = self.query(current, backward).await?;
            trace!(
                channel = %self.channel.id(),
                entries = page.messages.len(),
                backward,
                "Received page"
            );

            let known = self.known_set(&page).await?;
            let partial = compute_partial_dag(&page.messages, |h| known.contains(h));
            if !partial.external.is_empty() {
                trace!(
                    channel = %self.channel.id(),
                    external = partial.external.len(),
                    "Page references parents outside it"
                );
            }

            let page_parents: HashMap<ContentHash, &Vec<ContentHash>> = page
                .messages
                .iter()
                .map(|m| (m.hash, &m.parents))
                .collect();
            for hash in &partial.unresolved {
                if let Some(parents) = page_parents.get(hash) {
                    unresolved.insert(*hash, (*parents).clone());
                }
            }

            self.fetch(&partial.resolved).await?;
            for hash in &partial.resolved {
                // Parents missing on the remote leave a resolved entry unfetched
                if !self.channel.has_message(hash).await? {
                    if let Some(parents) = page_parents.get(hash) {
                        unresolved.insert(*hash, (*parents).clone());
                    }
                }
            }
            self.drain_unresolved(&mut unresolved).await?;

            if !full && unresolved.len() > self.config.max_unresolved {
                return Ok(PassOutcome::Escalate("too many unresolved messages"));
            }

            if backward {
                if unresolved.is_empty() {
                    backward = false;
                    cursor = resume.take();
                } else {
                    match page.backward_hash {
                        Some(hash) => cursor = Some(Cursor::Hash(hash)),
                        None => return Ok(PassOutcome::Escalate("backward walk exhausted")),
                    }
                }
            } else if !full && !unresolved.is_empty() {
                match page.backward_hash {
                    Some(hash) => {
                        resume = page.forward_hash.map(Cursor::Hash);
                        backward = true;
                        cursor = Some(Cursor::Hash(hash));
                    }
                    None => return Ok(PassOutcome::Escalate("no earlier pages to walk")),
                }
            } else {
                cursor = page.forward_hash.map(Cursor::Hash);
            }
        }

        if !unresolved.is_empty() {
            return Ok(PassOutcome::Escalate("walk ended with unresolved messages"));
        }
        debug!(channel = %self.channel.id(), full, "Sync walk complete");
        Ok(PassOutcome::Done)
    }

    /// Hashes of the page and their parents that are stored locally.
    async fn known_set(&self, page: &QueryPage) -> Result<HashSet<ContentHash>> {
        let mut candidates: HashSet<ContentHash> = HashSet::new();
        for message in &page.messages {
            candidates.insert(message.hash);
            candidates.extend(message.parents.iter().copied());
        }
        let mut known = HashSet::new();
        for hash in candidates {
            if self.channel.has_message(&hash).await? {
                known.insert(hash);
            }
        }
        Ok(known)
    }

    async fn all_known(&self, hashes: &[ContentHash]) -> Result<bool> {
        for hash in hashes {
            if !self.channel.has_message(hash).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fetches unresolved entries whose parents have become known, until a
    /// round makes no progress.
    async fn drain_unresolved(
        &self,
        unresolved: &mut HashMap<ContentHash, Vec<ContentHash>>,
    ) -> Result<()> {
        loop {
            let entries: Vec<(ContentHash, Vec<ContentHash>)> = unresolved
                .iter()
                .map(|(h, p)| (*h, p.clone()))
                .collect();

            let mut ready = Vec::new();
            for (hash, parents) in entries {
                if self.channel.has_message(&hash).await? {
                    unresolved.remove(&hash);
                } else if self.all_known(&parents).await? {
                    ready.push(hash);
                }
            }
            if ready.is_empty() {
                return Ok(());
            }

            ready.sort();
            self.fetch(&ready).await?;

            let mut progressed = false;
            for hash in &ready {
                if self.channel.has_message(hash).await? {
                    unresolved.remove(hash);
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Fetches and admits `hashes` in chunks of `bulk_limit`.
    async fn fetch(&self, hashes: &[ContentHash]) -> Result<()> {
        for chunk in hashes.chunks(self.config.bulk_limit.max(1)) {
            let mut offset = 0;
            while offset < chunk.len() {
                let wanted = &chunk[offset..];
                let (messages, forward_index) = self.bulk(wanted.to_vec()).await?;
                let consumed = forward_index as usize;
                if consumed == 0 || consumed > wanted.len() {
                    return Err(Error::protocol(format!(
                        "Bulk response consumed {} of {} hashes",
                        consumed,
                        wanted.len()
                    )));
                }

                let requested: HashSet<&ContentHash> = wanted[..consumed].iter().collect();
                for encrypted in &messages {
                    let hash = encrypted.hash()?;
                    if !requested.contains(&hash) {
                        return Err(Error::protocol(format!(
                            "Bulk response carried unrequested message {}",
                            hash
                        )));
                    }
                    match self.channel.receive(encrypted).await {
                        Ok(_) => {}
                        Err(Error::ParentNotFound(parent)) => {
                            debug!(hash = %hash, parent = %parent, "Deferring message with missing parent");
                        }
                        Err(e) => return Err(e),
                    }
                }
                offset += consumed;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    async fn query(&self, cursor: Cursor, is_backward: bool) -> Result<QueryPage> {
        let rx = Self::install(&self.closed, &self.pending_query)?;
        self.sender
            .send_packet(Packet::Query {
                channel_id: *self.channel.id(),
                cursor,
                is_backward,
                limit: self.config.query_limit,
            })
            .await?;
        self.await_response(rx, &self.pending_query).await
    }

    async fn bulk(&self, hashes: Vec<ContentHash>) -> Result<BulkReply> {
        let rx = Self::install(&self.closed, &self.pending_bulk)?;
        self.sender
            .send_packet(Packet::Bulk {
                channel_id: *self.channel.id(),
                hashes,
            })
            .await?;
        self.await_response(rx, &self.pending_bulk).await
    }

    fn install<T>(
        closed: &AtomicBool,
        slot: &Mutex<Option<oneshot::Sender<T>>>,
    ) -> Result<oneshot::Receiver<T>> {
        if closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (tx, rx) = oneshot::channel();
        *slot.lock() = Some(tx);
        Ok(rx)
    }

    async fn await_response<T>(
        &self,
        rx: oneshot::Receiver<T>,
        slot: &Mutex<Option<oneshot::Sender<T>>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                slot.lock().take();
                warn!(channel = %self.channel.id(), "Sync response timed out");
                Err(Error::SyncTimeout)
            }
        }
    }
}
