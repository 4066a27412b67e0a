use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use k256::ecdsa::VerifyingKey;

use crate::chain::Blockchain;
use crate::config::BootstrapPeer;
use crate::crypto::{
    derive_shared_key, digest256, public_key_bytes, public_key_from_bytes, Keypair,
    SHARED_KEY_LEN,
};
use crate::errors::{ChainError, ChainResult};
use crate::p2p::message::{Message, MessageKind, MAX_MESSAGE_SIZE};
use crate::p2p::peer::Peer;
use crate::types::{bytes_to_u64, u64_to_bytes, unix_time, Block, Hash, Transaction};

pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PING_PERIOD: Duration = Duration::from_secs(5);
const PROPAGATE_PERIOD: Duration = Duration::from_secs(5);
const PEER_EXPIRY_SECS: u64 = 10;

/// Handshake payload sent by the dialer right after connecting.
#[derive(Debug, Serialize, Deserialize)]
struct PeerInfo {
    chain_id: u64,
    protocol_hash: Hash,
    latest_block: Hash,
}

#[derive(Clone)]
struct PeerEntry {
    peer: Peer,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

struct NodeInner {
    keypair: Keypair,
    id: Hash,
    listen: SocketAddr,
    chain: Blockchain,
    peers: RwLock<HashMap<String, PeerEntry>>,
    /// Head hashes already announced, per peer.
    notified: RwLock<HashMap<Hash, HashSet<String>>>,
    blocks_transmitted: RwLock<HashSet<Hash>>,
    blocks_received: RwLock<HashSet<Hash>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Gossip node: one authenticated encrypted TCP connection per peer, ping
/// liveness, head-hash propagation with pull-on-miss, and handshake sync.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(keypair: Keypair, listen: SocketAddr, chain: Blockchain) -> Self {
        let id = digest256(&public_key_bytes(&keypair.public_key()));
        Self {
            inner: Arc::new(NodeInner {
                keypair,
                id,
                listen,
                chain,
                peers: RwLock::new(HashMap::new()),
                notified: RwLock::new(HashMap::new()),
                blocks_transmitted: RwLock::new(HashSet::new()),
                blocks_received: RwLock::new(HashSet::new()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Hash {
        self.inner.id
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.inner.keypair.public_key()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn has_received(&self, hash: &Hash) -> bool {
        self.inner.blocks_received.read().contains(hash)
    }

    /// Binds the listener, starts the accept / ping / propagation tasks, and
    /// dials the bootstrap set. Returns the bound address.
    pub async fn start(&self, bootstrap: &[BootstrapPeer]) -> ChainResult<SocketAddr> {
        let listener = TcpListener::bind(self.inner.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(client_id = %self.inner.id.to_cxid(), %local_addr, "node started");

        let accept = self.inner.clone();
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept.cancel.cancelled() => return,
                    incoming = listener.accept() => match incoming {
                        Ok((stream, addr)) => {
                            let inner = accept.clone();
                            tokio::spawn(async move {
                                let (reader, writer) = stream.into_split();
                                let writer = Arc::new(tokio::sync::Mutex::new(writer));
                                inner.read_loop(reader, writer, addr).await;
                            });
                        }
                        Err(err) => error!(?err, "failed to accept connection"),
                    },
                }
            }
        }));

        let ping = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(PING_PERIOD);
            loop {
                tokio::select! {
                    _ = ping.cancel.cancelled() => return,
                    _ = ticker.tick() => ping.ping_tick().await,
                }
            }
        }));

        let propagate = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(PROPAGATE_PERIOD);
            loop {
                tokio::select! {
                    _ = propagate.cancel.cancelled() => return,
                    _ = ticker.tick() => propagate.propagate_tick().await,
                }
            }
        }));
        drop(tasks);

        for peer in bootstrap {
            let public_key = match hex::decode(&peer.public_key)
                .map_err(|err| ChainError::Config(format!("invalid key encoding: {err}")))
                .and_then(|bytes| public_key_from_bytes(&bytes))
            {
                Ok(key) => key,
                Err(err) => {
                    warn!(addr = %peer.addr, ?err, "bad bootstrap key");
                    continue;
                }
            };
            if let Err(err) = self.connect(peer.addr, &public_key).await {
                warn!(addr = %peer.addr, ?err, "bootstrap dial failed");
            }
        }

        Ok(local_addr)
    }

    /// Dials a peer whose public key is known, registers the connection, and
    /// opens the handshake with our chain identity and latest hash.
    pub async fn connect(&self, addr: SocketAddr, public_key: &VerifyingKey) -> ChainResult<()> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ChainError::Transport(format!("dial timeout for {addr}")))??;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let shared_key = derive_shared_key(&self.inner.keypair, public_key)?;
        let cxid = digest256(&public_key_bytes(public_key)).to_cxid();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let entry = PeerEntry {
            peer: Peer::new(
                peer_addr,
                PROTOCOL_VERSION,
                *public_key,
                shared_key,
                unix_time(),
            ),
            writer: writer.clone(),
        };
        self.inner.peers.write().insert(cxid.clone(), entry);

        let reader_inner = self.inner.clone();
        self.inner.tasks.lock().push(tokio::spawn(async move {
            reader_inner.read_loop(read_half, writer, peer_addr).await;
        }));

        let latest = self.inner.chain.get_latest_block();
        let info = PeerInfo {
            chain_id: self.inner.chain.chain_id(),
            protocol_hash: self.inner.chain.protocol_hash(),
            latest_block: latest.hash,
        };
        self.inner
            .send_to(&cxid, MessageKind::PeerInfo, &serde_json::to_vec(&info)?)
            .await
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.peers.write().clear();
        info!("node stopped");
    }
}

impl NodeInner {
    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        addr: SocketAddr,
    ) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = timeout(READ_DEADLINE, read_frame(&mut reader)) => frame,
            };

            let bytes = match frame {
                Err(_) => {
                    debug!(remote_addr = %addr, "read deadline elapsed");
                    return;
                }
                Ok(Err(err)) => {
                    debug!(remote_addr = %addr, ?err, "connection closed");
                    return;
                }
                Ok(Ok(None)) => return,
                Ok(Ok(Some(bytes))) => bytes,
            };

            match Message::from_bytes(&bytes) {
                Ok(message) => self.handle_message(message, addr, &writer).await,
                Err(err) => warn!(remote_addr = %addr, ?err, "undecodable message"),
            }
        }
    }

    /// Incoming pipeline: verify signature, derive or refresh the peer,
    /// decrypt, cross-check the embedded key, then dispatch. Failures drop
    /// the message, never the connection.
    async fn handle_message(
        &self,
        message: Message,
        addr: SocketAddr,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ) {
        let public_key = match message.verify() {
            Ok(key) => key,
            Err(err) => {
                warn!(remote_addr = %addr, ?err, "invalid message signature");
                return;
            }
        };

        let cxid = digest256(&message.sender).to_cxid();
        let shared_key = match self.refresh_peer(&cxid, &public_key, addr, writer) {
            Ok(key) => key,
            Err(err) => {
                warn!(client_id = %cxid, ?err, "failed to register peer");
                return;
            }
        };

        let payload = match message.decrypt(&shared_key) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(client_id = %cxid, ?err, "failed to decrypt message");
                return;
            }
        };
        if payload.public_key != message.sender {
            warn!(client_id = %cxid, "embedded key does not match envelope sender");
            return;
        }

        debug!(client_id = %cxid, kind = ?message.kind, "message received");
        match message.kind {
            MessageKind::Ping => self.handle_ping(&cxid).await,
            MessageKind::Pong => {}
            MessageKind::Block => self.handle_block(&cxid, &payload.body).await,
            MessageKind::Hash => self.handle_hash(&cxid, &payload.body).await,
            MessageKind::Transaction => self.handle_transaction(&cxid, &payload.body),
            MessageKind::Ask => self.handle_ask(&cxid, &payload.body).await,
            MessageKind::Diff => self.handle_diff(&cxid, &payload.body).await,
            MessageKind::PeerInfo => self.handle_peer_info(&cxid, &payload.body).await,
        }
    }

    /// Returns the shared key for a peer, inserting a fresh entry with the
    /// connection's write handle when this is the first message from it.
    fn refresh_peer(
        &self,
        cxid: &str,
        public_key: &VerifyingKey,
        addr: SocketAddr,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ) -> ChainResult<[u8; SHARED_KEY_LEN]> {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(cxid) {
            entry.peer.set_last_seen(unix_time());
            return Ok(*entry.peer.shared_key());
        }

        let shared_key = derive_shared_key(&self.keypair, public_key)?;
        peers.insert(
            cxid.to_string(),
            PeerEntry {
                peer: Peer::new(
                    addr,
                    PROTOCOL_VERSION,
                    *public_key,
                    shared_key,
                    unix_time(),
                ),
                writer: writer.clone(),
            },
        );
        info!(client_id = %cxid, remote_addr = %addr, "peer registered");
        Ok(shared_key)
    }

    async fn handle_ping(&self, cxid: &str) {
        if let Err(err) = self
            .send_to(cxid, MessageKind::Pong, &u64_to_bytes(unix_time()))
            .await
        {
            warn!(client_id = %cxid, ?err, "failed to answer ping");
        }
    }

    async fn handle_block(&self, cxid: &str, body: &[u8]) {
        let block: Block = match serde_json::from_slice(body) {
            Ok(block) => block,
            Err(err) => {
                warn!(client_id = %cxid, ?err, "undecodable block");
                return;
            }
        };
        let hash = block.hash;

        if let Err(err) = self.chain.add_remote_block(block) {
            warn!(client_id = %cxid, ?err, "remote block rejected");
            return;
        }
        self.blocks_received.write().insert(hash);
        info!(client_id = %cxid, hash = %hash, "remote block accepted");

        self.broadcast(MessageKind::Hash, hash.as_bytes(), Some(cxid))
            .await;
    }

    async fn handle_hash(&self, cxid: &str, body: &[u8]) {
        let hash = Hash::from_slice(body);
        if !self.chain.has_block(&hash) {
            if let Err(err) = self.send_to(cxid, MessageKind::Ask, hash.as_bytes()).await {
                warn!(client_id = %cxid, ?err, "failed to request block");
            }
        }
    }

    async fn handle_ask(&self, cxid: &str, body: &[u8]) {
        let hash = Hash::from_slice(body);
        let block = match self.chain.get_block_by_hash(&hash) {
            Ok(Some(block)) => block,
            Ok(None) => return,
            Err(err) => {
                warn!(client_id = %cxid, ?err, "block lookup failed");
                return;
            }
        };
        if let Err(err) = self.send_block(cxid, &block).await {
            warn!(client_id = %cxid, ?err, "failed to serve block");
            return;
        }
        self.blocks_transmitted.write().insert(hash);
    }

    fn handle_transaction(&self, cxid: &str, body: &[u8]) {
        let tx: Transaction = match serde_json::from_slice(body) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(client_id = %cxid, ?err, "undecodable transaction");
                return;
            }
        };
        if let Err(err) = self.chain.add_transaction(tx) {
            warn!(client_id = %cxid, ?err, "gossiped transaction rejected");
        }
    }

    async fn handle_diff(&self, cxid: &str, body: &[u8]) {
        if body.len() != 8 {
            warn!(client_id = %cxid, "malformed height diff");
            return;
        }
        self.send_missing_blocks(cxid, bytes_to_u64(body)).await;
    }

    async fn handle_peer_info(&self, cxid: &str, body: &[u8]) {
        let info: PeerInfo = match serde_json::from_slice(body) {
            Ok(info) => info,
            Err(err) => {
                warn!(client_id = %cxid, ?err, "undecodable peer info");
                return;
            }
        };

        if info.chain_id != self.chain.chain_id() {
            warn!(client_id = %cxid, chain_id = info.chain_id, "peer is on a different chain");
            return;
        }
        if info.protocol_hash != self.chain.protocol_hash() {
            warn!(client_id = %cxid, "peer runs a different protocol");
            return;
        }

        if !info.latest_block.is_valid() {
            return;
        }
        let theirs = match self.chain.get_block_by_hash(&info.latest_block) {
            Ok(Some(block)) => block,
            Ok(None) => {
                debug!(client_id = %cxid, "peer head unknown locally");
                return;
            }
            Err(err) => {
                warn!(client_id = %cxid, ?err, "head lookup failed");
                return;
            }
        };

        let mine = self.chain.get_latest_block();
        if theirs.height() == mine.height() {
            info!(client_id = %cxid, "peer synced");
            return;
        }
        self.send_missing_blocks(cxid, theirs.height()).await;
    }

    /// Streams every block above `from_height` up to our head, one BLOCK
    /// message each.
    async fn send_missing_blocks(&self, cxid: &str, from_height: u64) {
        let head = self.chain.get_latest_block().height();
        if from_height >= head {
            return;
        }
        info!(client_id = %cxid, from_height, head, "syncing peer");
        for height in from_height + 1..=head {
            let block = match self.chain.get_block_by_height(height) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    warn!(height, "missing block during sync");
                    return;
                }
                Err(err) => {
                    warn!(height, ?err, "block lookup failed during sync");
                    return;
                }
            };
            if let Err(err) = self.send_block(cxid, &block).await {
                warn!(client_id = %cxid, ?err, "sync send failed");
                return;
            }
        }
    }

    async fn send_block(&self, cxid: &str, block: &Block) -> ChainResult<()> {
        self.send_to(cxid, MessageKind::Block, &serde_json::to_vec(block)?)
            .await
    }

    async fn send_to(&self, cxid: &str, kind: MessageKind, body: &[u8]) -> ChainResult<()> {
        let (shared_key, writer) = {
            let peers = self.peers.read();
            let entry = peers
                .get(cxid)
                .ok_or_else(|| ChainError::Transport(format!("unknown peer {cxid}")))?;
            (*entry.peer.shared_key(), entry.writer.clone())
        };

        let mut message = Message::new(kind, body, &self.keypair.public_key(), &shared_key)?;
        message.sign(&self.keypair)?;
        let frame = message.to_frame()?;

        let mut guard = writer.lock().await;
        timeout(WRITE_DEADLINE, guard.write_all(&frame))
            .await
            .map_err(|_| ChainError::Transport(format!("write deadline for {cxid}")))??;
        Ok(())
    }

    async fn broadcast(&self, kind: MessageKind, body: &[u8], except: Option<&str>) {
        let targets: Vec<String> = {
            let peers = self.peers.read();
            peers
                .keys()
                .filter(|cxid| Some(cxid.as_str()) != except)
                .cloned()
                .collect()
        };
        for cxid in targets {
            if let Err(err) = self.send_to(&cxid, kind, body).await {
                warn!(client_id = %cxid, ?err, "broadcast failed");
            }
        }
    }

    /// Evicts silent peers and pings the rest.
    async fn ping_tick(&self) {
        let now = unix_time();
        let expired: Vec<String> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.peer.last_seen()) > PEER_EXPIRY_SECS)
                .map(|(cxid, _)| cxid.clone())
                .collect()
        };
        for cxid in expired {
            // Dropping the entry drops the write half, which closes the
            // connection and terminates the peer's reader.
            self.peers.write().remove(&cxid);
            info!(client_id = %cxid, "client disconnected");
        }

        let targets: Vec<String> = self.peers.read().keys().cloned().collect();
        for cxid in targets {
            if let Err(err) = self
                .send_to(&cxid, MessageKind::Ping, &u64_to_bytes(now))
                .await
            {
                warn!(client_id = %cxid, ?err, "ping failed");
            }
        }
    }

    /// Announces the current head hash to every peer not yet notified.
    /// Gating is strictly per peer: serving a block over ASK elsewhere must
    /// not silence announcements to peers that never heard the hash.
    async fn propagate_tick(&self) {
        let latest = self.chain.get_latest_block();
        let hash = latest.hash;
        if !hash.is_valid() {
            return;
        }

        let pending: Vec<String> = {
            let peers = self.peers.read();
            let notified = self.notified.read();
            let already = notified.get(&hash);
            peers
                .keys()
                .filter(|cxid| !already.map_or(false, |set| set.contains(*cxid)))
                .cloned()
                .collect()
        };

        for cxid in pending {
            match self.send_to(&cxid, MessageKind::Hash, hash.as_bytes()).await {
                Ok(()) => {
                    self.notified
                        .write()
                        .entry(hash)
                        .or_default()
                        .insert(cxid.clone());
                    debug!(client_id = %cxid, hash = %hash, "head announced");
                }
                Err(err) => warn!(client_id = %cxid, ?err, "head announcement failed"),
            }
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> ChainResult<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(ChainError::Decode(format!("invalid frame length {len}")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
