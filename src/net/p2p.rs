// P2P Network (C9): peer table, handshake, scheduled maintenance, broadcast
// and relay. Builds directly on the Peer Connection framing in `protocol`
// and drives `ChainManager`/`Mempool` the same way the teacher's P2PNode
// drives `ChainDB`/`Mempool`, minus the Tor/.onion bootstrap path — there is
// no hidden-service requirement here and `tokio_socks` is not part of this
// stack.

use crate::config;
use crate::consensus::chain::ChainManager;
use crate::error::NetworkError;
use crate::mempool::Mempool;
use crate::net::protocol::{Envelope, FramedStream, MessageType};
use crate::net::sync::{SyncState, Synchronizer};
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const PEER_IDLE_EXPIRY_SECS: u64 = 3600;
const BAN_DURATION_SECS: u64 = 3600;
const MAX_OUTBOUND_FAILURES: u32 = 3;
const SYNC_HEIGHT_LEAD: i64 = 3;
const GET_BLOCKS_RESPONSE_CAP: u32 = 50;
const GET_HEADERS_RESPONSE_CAP: u32 = 2000;
const MAX_PEERS_IN_PEERS_MSG: usize = 100;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn now_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub height: i64,
    pub best_hash: String,
    pub node_id: String,
    pub user_agent: String,
    pub is_outbound: bool,
    pub last_seen: u64,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
}

struct Shared {
    peers: HashMap<SocketAddr, PeerInfo>,
    peer_addresses: HashSet<SocketAddr>,
    banned_ips: HashMap<IpAddr, u64>,
    outbound_failures: HashMap<IpAddr, u32>,
}

/// Outbound broadcast fan-out: every active connection subscribes and
/// forwards anything sent here to its socket.
type BroadcastTx = broadcast::Sender<Envelope>;

pub struct P2PNetwork {
    chain: Arc<ChainManager>,
    mempool: Arc<Mempool>,
    node_id: String,
    chain_id: u32,
    p2p_port: u16,
    shared: Mutex<Shared>,
    broadcast_tx: BroadcastTx,
    /// One catch-up session at a time, driven by whichever connection holds
    /// the matching peer id in `Synchronizer::peer()`. Every other peer's
    /// `Blocks`/`Headers` traffic is treated as ordinary gossip relay.
    sync: Mutex<Synchronizer>,
}

impl P2PNetwork {
    pub fn new(chain: Arc<ChainManager>, mempool: Arc<Mempool>, p2p_port: u16) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        let mut node_id_bytes = [0u8; 16];
        let _ = getrandom::getrandom(&mut node_id_bytes);
        let chain_id = chain.chain_id();
        P2PNetwork {
            chain,
            mempool,
            node_id: hex::encode(node_id_bytes),
            chain_id,
            p2p_port,
            shared: Mutex::new(Shared {
                peers: HashMap::new(),
                peer_addresses: HashSet::new(),
                banned_ips: HashMap::new(),
                outbound_failures: HashMap::new(),
            }),
            broadcast_tx,
            sync: Mutex::new(Synchronizer::new()),
        }
    }

    async fn send_get_data_for_heights(
        &self,
        stream: &Mutex<FramedStream>,
        heights: &[u32],
    ) -> Result<(), NetworkError> {
        let items: Vec<Value> = heights.iter().map(|h| json!({"type": 2, "height": h})).collect();
        let req = Envelope::new(MessageType::GetData, now_f64(), json!({"items": items}));
        stream.lock().await.send(&req).await.map_err(NetworkError::Io)
    }

    pub fn broadcast_transaction(&self, tx: &Transaction) {
        let env = Envelope::new(MessageType::Transaction, now_f64(), tx_to_value(tx));
        let _ = self.broadcast_tx.send(env);
    }

    pub fn broadcast_block(&self, block: &Block) {
        let inv = Envelope::new(
            MessageType::Inventory,
            now_f64(),
            json!({"type": 2, "hash": crate::crypto::hash::hash_to_hex(&block.hash), "height": block.height}),
        );
        let _ = self.broadcast_tx.send(inv);
        let blocks = Envelope::new(MessageType::Blocks, now_f64(), json!([block]));
        let _ = self.broadcast_tx.send(blocks);
    }

    async fn is_banned(&self, ip: IpAddr) -> bool {
        let shared = self.shared.lock().await;
        shared.banned_ips.get(&ip).is_some_and(|exp| *exp > now_secs())
    }

    async fn record_outbound_failure(&self, ip: IpAddr) {
        let mut shared = self.shared.lock().await;
        let failures = shared.outbound_failures.entry(ip).or_insert(0);
        *failures += 1;
        if *failures >= MAX_OUTBOUND_FAILURES {
            shared.banned_ips.insert(ip, now_secs() + BAN_DURATION_SECS);
            shared.outbound_failures.remove(&ip);
            warn!(%ip, "banned after repeated outbound failures");
        }
    }

    async fn clear_outbound_failures(&self, ip: IpAddr) {
        let mut shared = self.shared.lock().await;
        shared.outbound_failures.remove(&ip);
    }

    pub async fn run(self: Arc<Self>, bind_addr: &str) -> Result<(), NetworkError> {
        let addr: SocketAddr = format!("{bind_addr}:{}", self.p2p_port)
            .parse()
            .map_err(|_| NetworkError::ChainIdMismatch)?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "p2p listening");

        let this = self.clone();
        tokio::spawn(async move { this.maintenance_loop().await });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if self.is_banned(peer_addr.ip()).await {
                continue;
            }
            {
                let shared = self.shared.lock().await;
                if shared.peers.len() >= config::MAX_PEERS {
                    continue;
                }
            }
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr, false).await {
                    warn!(%peer_addr, error = %e, "inbound connection ended");
                }
            });
        }
    }

    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(), NetworkError> {
        {
            let shared = self.shared.lock().await;
            let outbound = shared.peers.values().filter(|p| p.is_outbound).count();
            if outbound >= config::OUTBOUND_PEER_TARGET {
                return Ok(());
            }
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                self.clear_outbound_failures(addr.ip()).await;
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle_connection(stream, addr, true).await {
                        warn!(%addr, error = %e, "outbound connection ended");
                    }
                });
                Ok(())
            }
            Err(e) => {
                self.record_outbound_failure(addr.ip()).await;
                Err(NetworkError::Io(e))
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        is_outbound: bool,
    ) -> Result<(), NetworkError> {
        let stream = Mutex::new(FramedStream::new(stream));
        let mut broadcast_rx = self.broadcast_tx.subscribe();

        self.send_handshake(&stream).await?;

        let handshake_deadline = now_secs() + HANDSHAKE_TIMEOUT_SECS;
        let mut handshake_done = false;

        loop {
            tokio::select! {
                recv_res = async { stream.lock().await.recv().await } => {
                    let envelope = match recv_res.map_err(NetworkError::Io)? {
                        Some(e) => e,
                        None => break,
                    };
                    if !handshake_done {
                        if now_secs() > handshake_deadline {
                            return Err(NetworkError::ChainIdMismatch);
                        }
                        if envelope.kind() != Some(MessageType::Handshake) {
                            continue;
                        }
                        handshake_done = self.process_handshake(&envelope, addr, is_outbound, &stream).await?;
                        continue;
                    }
                    self.dispatch(envelope, addr, &stream).await?;
                }
                relayed = broadcast_rx.recv() => {
                    if let Ok(env) = relayed {
                        if handshake_done {
                            let _ = stream.lock().await.send(&env).await;
                        }
                    }
                }
            }
        }

        let mut shared = self.shared.lock().await;
        shared.peers.remove(&addr);
        shared.peer_addresses.remove(&addr);
        drop(shared);
        self.sync.lock().await.on_peer_disconnected(&addr.to_string());
        info!(%addr, "peer disconnected");
        Ok(())
    }

    async fn send_handshake(&self, stream: &Mutex<FramedStream>) -> Result<(), NetworkError> {
        let data = json!({
            "version": 1,
            "chain_id": self.chain_id,
            "height": self.chain.current_height(),
            "best_hash": crate::crypto::hash::hash_to_hex(&self.chain.best_hash()),
            "node_id": self.node_id,
            "user_agent": "qbitcoin/0.1",
            "timestamp": now_f64(),
            "services": 1,
            "relay": true,
        });
        let env = Envelope::new(MessageType::Handshake, now_f64(), data);
        stream.lock().await.send(&env).await.map_err(NetworkError::Io)
    }

    /// Returns true once the handshake is accepted and peer state recorded.
    async fn process_handshake(
        self: &Arc<Self>,
        envelope: &Envelope,
        addr: SocketAddr,
        is_outbound: bool,
        stream: &Mutex<FramedStream>,
    ) -> Result<bool, NetworkError> {
        let data = &envelope.data;
        let peer_chain_id = data["chain_id"].as_u64().unwrap_or(u64::MAX) as u32;
        if peer_chain_id != self.chain_id {
            warn!(%addr, "chain id mismatch, closing");
            return Err(NetworkError::ChainIdMismatch);
        }
        let peer_height = data["height"].as_i64().unwrap_or(-1);
        let peer_best_hash = data["best_hash"].as_str().unwrap_or_default().to_string();
        let node_id = data["node_id"].as_str().unwrap_or_default().to_string();
        let user_agent = data["user_agent"].as_str().unwrap_or_default().to_string();

        {
            let mut shared = self.shared.lock().await;
            shared.peers.insert(
                addr,
                PeerInfo {
                    addr,
                    height: peer_height,
                    best_hash: peer_best_hash,
                    node_id,
                    user_agent,
                    is_outbound,
                    last_seen: now_secs(),
                    last_latency_ms: None,
                    consecutive_failures: 0,
                },
            );
            shared.peer_addresses.insert(addr);
        }

        info!(%addr, peer_height, "handshake complete");

        let our_height = self.chain.current_height();
        let peer_id = addr.to_string();
        let worth_syncing = our_height < 0 || peer_height > our_height + SYNC_HEIGHT_LEAD;

        if worth_syncing {
            let mut sync = self.sync.lock().await;
            sync.start_sync(peer_id.clone(), peer_height, our_height);
            if sync.peer() == Some(peer_id.as_str()) {
                if let Some((start, end)) = sync.next_headers_request() {
                    sync.mark_headers_requested(end);
                    drop(sync);
                    let get_headers = Envelope::new(
                        MessageType::GetHeaders,
                        now_f64(),
                        json!({"start_height": start, "end_height": end}),
                    );
                    stream.lock().await.send(&get_headers).await.map_err(NetworkError::Io)?;
                }
            }
        }

        Ok(true)
    }

    async fn dispatch(
        self: &Arc<Self>,
        envelope: Envelope,
        addr: SocketAddr,
        stream: &Mutex<FramedStream>,
    ) -> Result<(), NetworkError> {
        let Some(kind) = envelope.kind() else { return Ok(()) };
        match kind {
            MessageType::Ping => {
                let height = envelope.data["height"].as_i64().unwrap_or(-1);
                self.touch_peer(addr, height).await;
                let pong = Envelope::new(
                    MessageType::Pong,
                    now_f64(),
                    json!({"timestamp": now_f64(), "height": self.chain.current_height()}),
                );
                stream.lock().await.send(&pong).await.map_err(NetworkError::Io)?;
            }
            MessageType::Pong => {
                let height = envelope.data["height"].as_i64().unwrap_or(-1);
                self.touch_peer(addr, height).await;
            }
            MessageType::GetBlocks => {
                let start = envelope.data["start_height"].as_u64().unwrap_or(0) as u32;
                let end_requested = envelope.data["end_height"].as_u64().unwrap_or(0) as u32;
                let end = end_requested.max(start).min(start + GET_BLOCKS_RESPONSE_CAP - 1);
                let mut blocks = Vec::new();
                for h in start..=end {
                    if let Ok(Some(b)) = self.chain.get_block_by_height(h) {
                        blocks.push(b);
                    } else {
                        break;
                    }
                }
                let resp = Envelope::new(MessageType::Blocks, now_f64(), json!(blocks));
                stream.lock().await.send(&resp).await.map_err(NetworkError::Io)?;
            }
            MessageType::Blocks => {
                let blocks: Vec<Block> = serde_json::from_value(envelope.data.clone()).unwrap_or_default();
                let peer_id = addr.to_string();
                let mut sync = self.sync.lock().await;
                let is_sync_session = sync.state == SyncState::BlocksSync && sync.peer() == Some(peer_id.as_str());
                if is_sync_session {
                    for block in blocks {
                        sync.on_block_received(block);
                    }
                    match sync.drain_ready_blocks(&self.chain, &self.mempool) {
                        Ok(true) => info!(%addr, "sync caught up to peer"),
                        Ok(false) => {
                            let reqs = sync.next_block_requests(self.chain.current_height());
                            drop(sync);
                            if !reqs.is_empty() {
                                self.send_get_data_for_heights(stream, &reqs).await?;
                            }
                        }
                        Err(e) => {
                            warn!(%addr, error = %e, "sync session aborted");
                            sync.abort();
                        }
                    }
                } else {
                    drop(sync);
                    let mut applied = 0;
                    for block in blocks {
                        match self.chain.add_block(block, &self.mempool) {
                            Ok(true) => applied += 1,
                            Ok(false) => break,
                            Err(e) => {
                                warn!(error = %e, "failed to apply relayed block");
                                break;
                            }
                        }
                    }
                    if applied > 0 {
                        info!(applied, "applied blocks from peer");
                    }
                }
            }
            MessageType::GetHeaders => {
                let start = envelope.data["start_height"].as_u64().unwrap_or(0) as u32;
                let end_requested = envelope.data["end_height"].as_u64().unwrap_or(0) as u32;
                let end = end_requested.max(start).min(start + GET_HEADERS_RESPONSE_CAP - 1);
                let mut headers = Vec::new();
                for h in start..=end {
                    match self.chain.get_block_by_height(h) {
                        Ok(Some(b)) => headers.push(b.header()),
                        _ => break,
                    }
                }
                let resp = Envelope::new(MessageType::Headers, now_f64(), json!(headers));
                stream.lock().await.send(&resp).await.map_err(NetworkError::Io)?;
            }
            MessageType::Headers => {
                let heights: Vec<u32> = envelope
                    .data
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|h| h["height"].as_u64().map(|v| v as u32)).collect())
                    .unwrap_or_default();
                if heights.is_empty() {
                    return Ok(());
                }
                let peer_id = addr.to_string();
                let mut sync = self.sync.lock().await;
                if sync.peer() != Some(peer_id.as_str()) {
                    // Headers from a peer we are not currently syncing
                    // against; nothing drives a catch-up session for them.
                    return Ok(());
                }
                match sync.on_headers_received(&heights) {
                    Ok(true) => {
                        let reqs = sync.next_block_requests(self.chain.current_height());
                        drop(sync);
                        if !reqs.is_empty() {
                            self.send_get_data_for_heights(stream, &reqs).await?;
                        }
                    }
                    Ok(false) => {
                        if let Some((start, end)) = sync.next_headers_request() {
                            sync.mark_headers_requested(end);
                            drop(sync);
                            let req = Envelope::new(
                                MessageType::GetHeaders,
                                now_f64(),
                                json!({"start_height": start, "end_height": end}),
                            );
                            stream.lock().await.send(&req).await.map_err(NetworkError::Io)?;
                        }
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "sync session aborted");
                        sync.abort();
                    }
                }
            }
            MessageType::GetData => {
                if let Some(items) = envelope.data["items"].as_array() {
                    let mut blocks = Vec::new();
                    for item in items {
                        if item["type"].as_u64() == Some(2) {
                            if let Some(height) = item["height"].as_u64() {
                                if let Ok(Some(b)) = self.chain.get_block_by_height(height as u32) {
                                    blocks.push(b);
                                }
                            }
                        }
                    }
                    if !blocks.is_empty() {
                        let resp = Envelope::new(MessageType::Blocks, now_f64(), json!(blocks));
                        stream.lock().await.send(&resp).await.map_err(NetworkError::Io)?;
                    }
                }
            }
            MessageType::Transaction => {
                if let Ok(tx) = serde_json::from_value::<Transaction>(envelope.data.clone()) {
                    let accounts = self.chain.accounts();
                    let store = self.chain.store();
                    let accepted = self
                        .mempool
                        .add_transaction(tx.clone(), &accounts, &store, now_secs())
                        .unwrap_or(false);
                    drop(store);
                    drop(accounts);
                    if accepted {
                        self.broadcast_transaction(&tx);
                    }
                }
            }
            MessageType::Inventory => {
                // Advisory announcement; the synchronizer decides whether to
                // pull. No direct state mutation here.
            }
            MessageType::GetPeers => {
                let shared = self.shared.lock().await;
                let peers: Vec<Value> = shared
                    .peer_addresses
                    .iter()
                    .take(MAX_PEERS_IN_PEERS_MSG)
                    .map(|a| json!({"address": a.ip().to_string(), "port": a.port()}))
                    .collect();
                drop(shared);
                let resp = Envelope::new(MessageType::Peers, now_f64(), json!({"peers": peers}));
                stream.lock().await.send(&resp).await.map_err(NetworkError::Io)?;
            }
            MessageType::Peers => {
                // Discovered addresses are recorded for future outbound
                // dialing by the maintain task; no immediate connection.
                if let Some(list) = envelope.data["peers"].as_array() {
                    let mut shared = self.shared.lock().await;
                    for p in list {
                        if let (Some(ip), Some(port)) = (p["address"].as_str(), p["port"].as_u64()) {
                            if let Ok(ip) = ip.parse::<IpAddr>() {
                                shared.peer_addresses.insert(SocketAddr::new(ip, port as u16));
                            }
                        }
                    }
                }
            }
            MessageType::Alert | MessageType::Reject => {
                // Advisory only; never mutates state.
            }
        }
        Ok(())
    }

    async fn touch_peer(&self, addr: SocketAddr, height: i64) {
        let mut shared = self.shared.lock().await;
        if let Some(info) = shared.peers.get_mut(&addr) {
            info.last_seen = now_secs();
            if height >= 0 {
                info.height = height;
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut discover = tokio::time::interval(Duration::from_secs(300));
        let mut ping = tokio::time::interval(Duration::from_secs(60));
        let mut cleanup = tokio::time::interval(Duration::from_secs(600));
        let mut maintain = tokio::time::interval(Duration::from_secs(30));
        let mut sync_watch = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = discover.tick() => self.discover().await,
                _ = ping.tick() => self.ping_peers().await,
                _ = cleanup.tick() => self.cleanup().await,
                _ = maintain.tick() => self.maintain_outbound().await,
                _ = sync_watch.tick() => self.check_sync_timeouts().await,
            }
        }
    }

    /// A stalled sync peer must not block catch-up forever: a headers
    /// timeout aborts the session (a later handshake picks a new peer), a
    /// blocks timeout just releases in-flight slots so `next_block_requests`
    /// re-issues them.
    async fn check_sync_timeouts(&self) {
        let mut sync = self.sync.lock().await;
        if sync.headers_timed_out() {
            warn!("header sync timed out, aborting session");
            sync.abort();
        } else if sync.blocks_timed_out() {
            warn!("block sync timed out, releasing in-flight requests for retry");
            sync.release_inflight_for_retry();
        }
    }

    async fn discover(self: &Arc<Self>) {
        let env = Envelope::new(MessageType::GetPeers, now_f64(), json!({}));
        let _ = self.broadcast_tx.send(env);
    }

    async fn ping_peers(self: &Arc<Self>) {
        let env = Envelope::new(
            MessageType::Ping,
            now_f64(),
            json!({"timestamp": now_f64(), "height": self.chain.current_height()}),
        );
        let _ = self.broadcast_tx.send(env);
    }

    async fn cleanup(&self) {
        let now = now_secs();
        let mut shared = self.shared.lock().await;
        shared.banned_ips.retain(|_, expiry| *expiry > now);
        shared.peers.retain(|_, info| now.saturating_sub(info.last_seen) < PEER_IDLE_EXPIRY_SECS);
    }

    async fn maintain_outbound(self: &Arc<Self>) {
        let candidates: Vec<SocketAddr> = {
            let shared = self.shared.lock().await;
            let outbound = shared.peers.values().filter(|p| p.is_outbound).count();
            if outbound >= config::OUTBOUND_PEER_TARGET {
                return;
            }
            shared
                .peer_addresses
                .iter()
                .filter(|a| !shared.peers.contains_key(a))
                .cloned()
                .collect()
        };
        for addr in candidates {
            let _ = self.connect(addr).await;
        }
    }
}

fn tx_to_value(tx: &Transaction) -> Value {
    serde_json::to_value(tx).unwrap_or(Value::Null)
}
