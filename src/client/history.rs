use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::client::chain::ChainReader;
use crate::client::config::ReconcilerConfig;
use crate::common::errors::{ReconcileError, Result};
use crate::common::models::ContributionRecord;
use crate::common::validation;

/// Merges `batch` into `existing`. A transaction hash already present keeps
/// its first record. Output is ordered by timestamp, then block, then log
/// index.
pub fn merge_contributions(
    existing: Vec<ContributionRecord>,
    batch: impl IntoIterator<Item = ContributionRecord>,
) -> Vec<ContributionRecord> {
    let mut seen = HashSet::new();
    let mut merged: Vec<ContributionRecord> = existing
        .into_iter()
        .chain(batch)
        .filter(|r| seen.insert(r.transaction_hash.clone()))
        .collect();
    merged.sort_by(|a, b| {
        (a.date, a.block_number, a.log_index).cmp(&(b.date, b.block_number, b.log_index))
    });
    merged
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredHistory {
    pub records: Vec<ContributionRecord>,
    pub last_synced_block: u64,
}

pub trait HistoryStore: Send + Sync + 'static {
    fn load(&self, group_id: u64) -> impl Future<Output = anyhow::Result<Option<StoredHistory>>> + Send;

    fn save(&self, group_id: u64, history: &StoredHistory) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: Mutex<HashMap<u64, StoredHistory>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    async fn load(&self, group_id: u64) -> anyhow::Result<Option<StoredHistory>> {
        Ok(self.entries.lock().await.get(&group_id).cloned())
    }

    async fn save(&self, group_id: u64, history: &StoredHistory) -> anyhow::Result<()> {
        self.entries.lock().await.insert(group_id, history.clone());
        Ok(())
    }
}

pub struct RedisHistoryStore {
    redis_manager: Arc<Mutex<ConnectionManager>>,
    ttl_secs: u64,
}

impl RedisHistoryStore {
    pub async fn new(redis_url: &str, ttl_secs: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis_manager = ConnectionManager::new(client).await?;
        info!("[HISTORY] Connected to Redis history store");
        Ok(Self {
            redis_manager: Arc::new(Mutex::new(redis_manager)),
            ttl_secs,
        })
    }

    fn key(group_id: u64) -> String {
        format!("thrift:history:{}", group_id)
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let mut conn = self.redis_manager.lock().await;
        let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
        if pong != "PONG" {
            anyhow::bail!("unexpected PING reply: {}", pong);
        }
        Ok(())
    }
}

impl HistoryStore for RedisHistoryStore {
    async fn load(&self, group_id: u64) -> anyhow::Result<Option<StoredHistory>> {
        let mut conn = self.redis_manager.lock().await;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(group_id))
            .query_async(&mut *conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, group_id: u64, history: &StoredHistory) -> anyhow::Result<()> {
        let json_data = serde_json::to_string(history)?;
        let mut conn = self.redis_manager.lock().await;
        let _: () = redis::cmd("SETEX")
            .arg(Self::key(group_id))
            .arg(self.ttl_secs)
            .arg(&json_data)
            .query_async(&mut *conn)
            .await?;
        debug!(
            "[HISTORY] Stored {} records for group {} up to block {}",
            history.records.len(),
            group_id,
            history.last_synced_block
        );
        Ok(())
    }
}

pub struct ContributionSync<R: ChainReader, S: HistoryStore> {
    reader: Arc<R>,
    store: Arc<S>,
    chunk_size: u64,
    max_blocks: u64,
}

impl<R: ChainReader, S: HistoryStore> ContributionSync<R, S> {
    pub fn new(reader: Arc<R>, store: Arc<S>, config: &ReconcilerConfig) -> Self {
        Self {
            reader,
            store,
            chunk_size: config.history_chunk_size.max(1),
            max_blocks: config.history_max_blocks,
        }
    }

    /// Brings the stored history for `group_id` up to the chain head and
    /// returns it. `force` rescans the full window. Progress is persisted per
    /// window, so a failed window leaves `last_synced_block` at the previous
    /// one.
    pub async fn sync(&self, group_id: u64, token_symbol: &str, force: bool) -> Result<Vec<ContributionRecord>> {
        let head = self.reader.block_number().await.map_err(ReconcileError::transient)?;
        let stored = if force {
            None
        } else {
            self.store
                .load(group_id)
                .await
                .map_err(|e| ReconcileError::Store(format!("{:#}", e)))?
        };

        let (mut history, mut from) = match stored {
            Some(h) if h.last_synced_block >= head => {
                debug!("[HISTORY] Group {} already synced to block {}", group_id, h.last_synced_block);
                return Ok(h.records);
            }
            Some(h) => {
                let from = h.last_synced_block + 1;
                (h, from)
            }
            None => (StoredHistory::default(), head.saturating_sub(self.max_blocks)),
        };

        info!("[HISTORY] Syncing group {} from block {} to {}", group_id, from, head);
        while from <= head {
            let to = from.saturating_add(self.chunk_size - 1).min(head);
            let events = self
                .reader
                .get_contribution_events(group_id, Some(from), Some(to))
                .await
                .map_err(|e| {
                    warn!("[HISTORY] Window {}..={} for group {} failed: {:#}", from, to, group_id, e);
                    ReconcileError::transient(e)
                })?;

            let mut batch = Vec::with_capacity(events.len());
            for event in events {
                match validation::validate_event(group_id, token_symbol, event) {
                    Ok(record) => batch.push(record),
                    Err(e) => warn!("[HISTORY] Skipping malformed event for group {}: {}", group_id, e),
                }
            }

            history = StoredHistory {
                records: merge_contributions(history.records, batch),
                last_synced_block: to,
            };
            self.store
                .save(group_id, &history)
                .await
                .map_err(|e| ReconcileError::Store(format!("{:#}", e)))?;
            from = to + 1;
        }

        Ok(history.records)
    }
}
