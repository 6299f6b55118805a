//! Order/trade pull gossip between connected peers.
//!
//! Two near-identical stream protocols: on a peer-connected event (per-peer
//! cooldown), open a stream, send one `SyncRequest`, read one response,
//! ingest, close. The incoming side answers from the store. The layer is
//! written against plain byte streams (a libp2p host hands its negotiated
//! streams straight in) and never touches in-memory swap state.

use crate::error::{Error, Result};
use crate::store::{
    OrderFilter, OrderRecord, OrderStatus, OrderStore, TradeFilter, TradeRecord, TradeStore,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub const ORDER_SYNC_PROTOCOL: &str = "/klingon/ordersync/1.0.0";
pub const TRADE_SYNC_PROTOCOL: &str = "/klingon/tradesync/1.0.0";

/// Records per response; requests asking for more are clamped.
pub const SYNC_BATCH_LIMIT: usize = 100;
/// Minimum gap between outbound syncs to the same peer.
pub const PEER_COOLDOWN: Duration = Duration::from_secs(300);
/// Settle delay before the first request on a fresh connection.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Deadline for one full sync exchange.
pub const SYNC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Pull request: records newer than `since`, at most `limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub since: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSyncResponse {
    pub orders: Vec<OrderRecord>,
    pub has_more: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSyncResponse {
    pub trades: Vec<TradeRecord>,
    pub has_more: bool,
    pub timestamp: i64,
}

/// Caller-provided order acceptance predicate.
pub type OrderValidator = Arc<dyn Fn(&OrderRecord) -> bool + Send + Sync>;

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &impl Serialize) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| Error::Other(format!("sync stream write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Other(format!("sync stream flush: {e}")))?;
    Ok(())
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Other(format!("sync stream read: {e}")))?;
    if n == 0 {
        return Err(Error::Other("sync stream closed early".to_string()));
    }
    Ok(line)
}

/// Per-peer cooldown bookkeeping shared by both sync protocols.
struct Cooldowns {
    last_attempt: Mutex<HashMap<String, Instant>>,
}

impl Cooldowns {
    fn new() -> Self {
        Self {
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt; returns false while the peer is cooling down.
    fn try_acquire(&self, peer: &str) -> bool {
        let mut last = self.last_attempt.lock().unwrap();
        let now = Instant::now();
        if let Some(at) = last.get(peer) {
            if now.duration_since(*at) < PEER_COOLDOWN {
                return false;
            }
        }
        last.insert(peer.to_string(), now);
        true
    }
}

/// Order gossip: pulls open orders from peers and serves ours.
pub struct OrderSync<S: OrderStore> {
    store: Arc<S>,
    validator: OrderValidator,
    cooldowns: Cooldowns,
    /// High-water mark of `created_at` per peer, so repeat syncs are
    /// incremental.
    watermarks: Mutex<HashMap<String, i64>>,
}

impl<S: OrderStore> OrderSync<S> {
    pub fn new(store: Arc<S>, validator: OrderValidator) -> Self {
        Self {
            store,
            validator,
            cooldowns: Cooldowns::new(),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a locally authored order; it becomes visible to peers on
    /// their next pull.
    pub async fn publish_order(&self, mut order: OrderRecord) -> Result<()> {
        order.is_local = true;
        order.updated_at = OffsetDateTime::now_utc().unix_timestamp();
        self.store.create_order(&order).await
    }

    /// Outbound exchange on peer-connected. Returns the number of ingested
    /// records, or `Ok(None)` when the peer is still cooling down.
    pub async fn sync_with_peer<Str>(&self, peer: &str, stream: Str) -> Result<Option<usize>>
    where
        Str: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.cooldowns.try_acquire(peer) {
            return Ok(None);
        }
        let since = *self.watermarks.lock().unwrap().get(peer).unwrap_or(&0);

        let exchange = async {
            tokio::time::sleep(SETTLE_DELAY).await;
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            send_line(
                &mut write_half,
                &SyncRequest {
                    since,
                    limit: SYNC_BATCH_LIMIT,
                },
            )
            .await?;
            let line = read_line(&mut reader).await?;
            let response: OrderSyncResponse = serde_json::from_str(line.trim())?;
            Ok::<_, Error>(response)
        };
        let response = tokio::time::timeout(SYNC_STREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Other(format!("order sync with {peer}: deadline exceeded")))??;

        if let Some(newest) = response.orders.iter().map(|o| o.created_at).max() {
            let mut marks = self.watermarks.lock().unwrap();
            let entry = marks.entry(peer.to_string()).or_insert(0);
            *entry = (*entry).max(newest);
        }

        let ingested = self.ingest_orders(&response.orders).await?;
        log::debug!(
            "order sync with {peer}: {} received, {ingested} ingested",
            response.orders.len()
        );
        Ok(Some(ingested))
    }

    /// Answer one inbound request from the store.
    pub async fn handle_incoming<Str>(&self, peer: &str, stream: Str) -> Result<()>
    where
        Str: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            let line = read_line(&mut reader).await?;
            let request: SyncRequest = serde_json::from_str(line.trim())?;
            let limit = request.limit.min(SYNC_BATCH_LIMIT);

            let orders = self
                .store
                .list_orders(OrderFilter {
                    status: Some(OrderStatus::Open),
                    since: Some(request.since),
                    limit: Some(limit),
                })
                .await?;
            let has_more = orders.len() == limit;

            send_line(
                &mut write_half,
                &OrderSyncResponse {
                    orders,
                    has_more,
                    timestamp: OffsetDateTime::now_utc().unix_timestamp(),
                },
            )
            .await
        };
        tokio::time::timeout(SYNC_STREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Other(format!("order sync from {peer}: deadline exceeded")))?
    }

    /// Apply remote orders to the local store.
    ///
    /// Unknown orders are inserted with `is_local = false`; known orders are
    /// updated only when the incoming record is newer, preserving the local
    /// `is_local` flag. Applying the same batch twice is a no-op.
    pub async fn ingest_orders(&self, orders: &[OrderRecord]) -> Result<usize> {
        let mut ingested = 0;
        for order in orders {
            if !(self.validator)(order) {
                log::debug!("order {} rejected by validator", order.id);
                continue;
            }
            match self.store.get_order(&order.id).await? {
                None => {
                    let mut record = order.clone();
                    record.is_local = false;
                    self.store.save_order(&record).await?;
                    ingested += 1;
                }
                Some(existing) => {
                    if order.updated_at > existing.updated_at {
                        let mut record = order.clone();
                        record.is_local = existing.is_local;
                        self.store.save_order(&record).await?;
                        ingested += 1;
                    }
                }
            }
        }
        Ok(ingested)
    }
}

/// Trade gossip: participant-filtered, state advances monotonically.
pub struct TradeSync<S: TradeStore> {
    store: Arc<S>,
    /// Our own peer id; we only ingest trades we participate in.
    local_peer: String,
    cooldowns: Cooldowns,
    watermarks: Mutex<HashMap<String, i64>>,
}

impl<S: TradeStore> TradeSync<S> {
    pub fn new(store: Arc<S>, local_peer: String) -> Self {
        Self {
            store,
            local_peer,
            cooldowns: Cooldowns::new(),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn sync_with_peer<Str>(&self, peer: &str, stream: Str) -> Result<Option<usize>>
    where
        Str: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.cooldowns.try_acquire(peer) {
            return Ok(None);
        }
        let since = *self.watermarks.lock().unwrap().get(peer).unwrap_or(&0);

        let exchange = async {
            tokio::time::sleep(SETTLE_DELAY).await;
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            send_line(
                &mut write_half,
                &SyncRequest {
                    since,
                    limit: SYNC_BATCH_LIMIT,
                },
            )
            .await?;
            let line = read_line(&mut reader).await?;
            let response: TradeSyncResponse = serde_json::from_str(line.trim())?;
            Ok::<_, Error>(response)
        };
        let response = tokio::time::timeout(SYNC_STREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Other(format!("trade sync with {peer}: deadline exceeded")))??;

        if let Some(newest) = response.trades.iter().map(|t| t.created_at).max() {
            let mut marks = self.watermarks.lock().unwrap();
            let entry = marks.entry(peer.to_string()).or_insert(0);
            *entry = (*entry).max(newest);
        }

        let ingested = self.ingest_trades(&response.trades).await?;
        log::debug!(
            "trade sync with {peer}: {} received, {ingested} ingested",
            response.trades.len()
        );
        Ok(Some(ingested))
    }

    /// Answer one inbound request; only trades the remote peer participates
    /// in are served.
    pub async fn handle_incoming<Str>(&self, peer: &str, stream: Str) -> Result<()>
    where
        Str: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            let line = read_line(&mut reader).await?;
            let request: SyncRequest = serde_json::from_str(line.trim())?;
            let limit = request.limit.min(SYNC_BATCH_LIMIT);

            let trades = self
                .store
                .list_trades(TradeFilter {
                    participant: Some(peer.to_string()),
                    since: Some(request.since),
                    limit: Some(limit),
                })
                .await?;
            let has_more = trades.len() == limit;

            send_line(
                &mut write_half,
                &TradeSyncResponse {
                    trades,
                    has_more,
                    timestamp: OffsetDateTime::now_utc().unix_timestamp(),
                },
            )
            .await
        };
        tokio::time::timeout(SYNC_STREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Other(format!("trade sync from {peer}: deadline exceeded")))?
    }

    /// Apply remote trades: only those we participate in, and only state
    /// advances that are strictly later in the terminal order.
    pub async fn ingest_trades(&self, trades: &[TradeRecord]) -> Result<usize> {
        let mut ingested = 0;
        for trade in trades {
            if trade.maker_peer != self.local_peer && trade.taker_peer != self.local_peer {
                continue;
            }
            match self.store.get_trade(&trade.id).await? {
                None => {
                    self.store.create_trade(trade).await?;
                    ingested += 1;
                }
                Some(existing) => {
                    if trade.state.is_strictly_later_than(existing.state) {
                        self.store.update_trade_state(&trade.id, trade.state).await?;
                        ingested += 1;
                    }
                }
            }
        }
        Ok(ingested)
    }
}
