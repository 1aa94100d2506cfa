use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::chain::ChainReader;
use crate::common::errors::{ReconcileError, Result};
use crate::common::models::GroupSnapshot;
use crate::common::validation;

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<GroupSnapshot>>>>;

struct Entry {
    snapshot: Arc<GroupSnapshot>,
    stale: bool,
}

struct InFlight {
    token: u64,
    future: SharedRefresh,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<u64, Entry>,
    in_flight: HashMap<u64, InFlight>,
    /// Highest refresh token issued when the id was last invalidated.
    invalidated_at: HashMap<u64, u64>,
}

/// Read replica of group state. Never authoritative; any entry can be thrown
/// away and fetched again.
pub struct ReconciliationCache<R: ChainReader> {
    reader: Arc<R>,
    state: Arc<Mutex<CacheState>>,
    tokens: Arc<AtomicU64>,
}

impl<R: ChainReader> Clone for ReconciliationCache<R> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            state: self.state.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: ChainReader> ReconciliationCache<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            reader,
            state: Arc::new(Mutex::new(CacheState::default())),
            tokens: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    /// Last fetched snapshot, unless it has been invalidated since.
    pub fn get(&self, id: u64) -> Option<Arc<GroupSnapshot>> {
        let state = lock(&self.state);
        state
            .entries
            .get(&id)
            .filter(|e| !e.stale)
            .map(|e| e.snapshot.clone())
    }

    /// Last fetched snapshot even when stale, for display during the
    /// staleness window.
    pub fn peek(&self, id: u64) -> Option<Arc<GroupSnapshot>> {
        lock(&self.state).entries.get(&id).map(|e| e.snapshot.clone())
    }

    pub fn is_stale(&self, id: u64) -> bool {
        lock(&self.state).entries.get(&id).map(|e| e.stale).unwrap_or(true)
    }

    pub fn is_refreshing(&self, id: u64) -> bool {
        lock(&self.state).in_flight.contains_key(&id)
    }

    /// Marks the entry stale without fetching. Refreshes already in flight
    /// may have read pre-mutation state, so later callers no longer join them
    /// and their results land as stale.
    pub fn invalidate(&self, id: u64) {
        let mut state = lock(&self.state);
        let issued = self.tokens.load(Ordering::SeqCst);
        state.invalidated_at.insert(id, issued);
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.stale = true;
        }
        if state.in_flight.remove(&id).is_some() {
            debug!("[CACHE] Detached in-flight refresh for group {} on invalidation", id);
        }
        info!("[CACHE] Invalidated group {}", id);
    }

    pub async fn get_or_refresh(&self, id: u64) -> Result<Arc<GroupSnapshot>> {
        match self.get(id) {
            Some(snapshot) => Ok(snapshot),
            None => self.refresh(id).await,
        }
    }

    /// Fetches group and members. Concurrent calls for the same id share one
    /// read and one result.
    pub async fn refresh(&self, id: u64) -> Result<Arc<GroupSnapshot>> {
        let future = {
            let mut state = lock(&self.state);
            match state.in_flight.get(&id) {
                Some(pending) => {
                    debug!("[CACHE] Joining in-flight refresh #{} for group {}", pending.token, id);
                    pending.future.clone()
                }
                None => {
                    let token = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = Self::fetch_and_store(
                        self.reader.clone(),
                        self.state.clone(),
                        id,
                        token,
                    )
                    .boxed()
                    .shared();
                    state.in_flight.insert(id, InFlight { token, future: future.clone() });
                    debug!("[CACHE] Started refresh #{} for group {}", token, id);
                    future
                }
            }
        };
        future.await
    }

    async fn fetch_and_store(
        reader: Arc<R>,
        state: Arc<Mutex<CacheState>>,
        id: u64,
        token: u64,
    ) -> Result<Arc<GroupSnapshot>> {
        let fetched = fetch_snapshot(reader.as_ref(), id, token).await;

        let mut guard = lock(&state);
        if guard.in_flight.get(&id).map(|f| f.token) == Some(token) {
            guard.in_flight.remove(&id);
        }

        let snapshot = match fetched {
            Ok(s) => Arc::new(s),
            Err(e) => {
                // previous value stays in place
                warn!("[CACHE] Refresh #{} for group {} failed: {}", token, id, e);
                return Err(e);
            }
        };

        if let Some(existing) = guard.entries.get(&id) {
            if existing.snapshot.token > token {
                debug!(
                    "[CACHE] Discarding refresh #{} for group {}; #{} is newer",
                    token, id, existing.snapshot.token
                );
                return Ok(existing.snapshot.clone());
            }
            if let (Some(old), Some(new)) = (&existing.snapshot.group, &snapshot.group) {
                if new.completed_payouts < old.completed_payouts {
                    warn!(
                        "[CACHE] Group {} completedPayouts went back from {} to {}; lagging RPC node?",
                        id, old.completed_payouts, new.completed_payouts
                    );
                }
            }
        }

        let stale = guard.invalidated_at.get(&id).map(|t| *t >= token).unwrap_or(false);
        if stale {
            debug!("[CACHE] Refresh #{} for group {} predates an invalidation; kept as stale", token, id);
        }
        guard.entries.insert(id, Entry { snapshot: snapshot.clone(), stale });
        Ok(snapshot)
    }
}

async fn fetch_snapshot<R: ChainReader>(reader: &R, id: u64, token: u64) -> Result<GroupSnapshot> {
    let record = reader.get_group(id).await.map_err(ReconcileError::transient)?;
    let record = match record {
        Some(r) if !validation::is_empty_record(&r) => r,
        _ => {
            debug!("[CACHE] Group {} does not exist on chain", id);
            return Ok(GroupSnapshot {
                id,
                group: None,
                members: Vec::new(),
                fetched_at: Utc::now(),
                token,
            });
        }
    };
    let group = validation::validate_group(id, record)?;

    let member_records = reader.get_members(id).await.map_err(ReconcileError::transient)?;
    let members = validation::validate_members(&group, member_records)?;
    if members.len() != group.total_members as usize {
        warn!(
            "[CACHE] Group {} reports {} members but {} were listed",
            id,
            group.total_members,
            members.len()
        );
    }

    Ok(GroupSnapshot {
        id,
        group: Some(group),
        members,
        fetched_at: Utc::now(),
        token,
    })
}

/// Monotonic request token for consumers that may go away before a fetch
/// resolves: take a token before the await, apply the result only if it is
/// still current.
#[derive(Debug, Default)]
pub struct ResponseGuard {
    latest: AtomicU64,
}

impl ResponseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == token
    }

    /// Makes every outstanding token stale (unmount).
    pub fn cancel(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }
}
