//! Entity-scoped cache slots shared by the engine, the pollers and the UI.
//!
//! Each slot is an independent `watch` channel, so invalidating one session's
//! log never disturbs another slot's value, subscribers or identity.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Notify, watch};
use vpsdeck_common::{Product, Session, WalletBalance};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Sessions,
    Products,
    Wallet,
    SessionLog(String),
}

#[derive(Debug, Clone)]
pub struct SlotState<T> {
    /// `None` until the first successful fetch.
    pub data: Option<T>,
    pub fetching: bool,
    pub error: Option<EngineError>,
    pub stale: bool,
    /// Number of successful writes.
    pub generation: u64,
    pub invalidations: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> Default for SlotState<T> {
    fn default() -> Self {
        Self {
            data: None,
            fetching: false,
            error: None,
            stale: true,
            generation: 0,
            invalidations: 0,
            updated_at: None,
        }
    }
}

impl<T> SlotState<T> {
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_fresh(&self) -> bool {
        self.data.is_some() && !self.stale
    }
}

/// Returned by [`Slot::begin_fetch`]; lets the completing fetch notice an
/// invalidation that raced with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    invalidations: u64,
}

#[derive(Debug)]
pub struct Slot<T> {
    key: CacheKey,
    state: watch::Sender<SlotState<T>>,
    invalidated: Notify,
}

impl<T: Clone> Slot<T> {
    pub fn new(key: CacheKey) -> Self {
        let (state, _) = watch::channel(SlotState::default());
        Self {
            key,
            state,
            invalidated: Notify::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotState<T>> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SlotState<T> {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.state.borrow().data.clone()
    }

    pub fn begin_fetch(&self) -> FetchTicket {
        let mut ticket = FetchTicket { invalidations: 0 };
        self.state.send_modify(|state| {
            state.fetching = true;
            ticket.invalidations = state.invalidations;
        });
        ticket
    }

    /// Claims the slot for a fetch unless one is already in flight.
    pub fn try_begin_fetch(&self) -> Option<FetchTicket> {
        let mut ticket = None;
        self.state.send_if_modified(|state| {
            if state.fetching {
                return false;
            }
            state.fetching = true;
            ticket = Some(FetchTicket {
                invalidations: state.invalidations,
            });
            true
        });
        ticket
    }

    /// Clears the in-flight flag of a fetch whose result will never be stored.
    pub fn abandon_fetch(&self, _ticket: FetchTicket) {
        self.state.send_modify(|state| state.fetching = false);
    }

    /// Runs `fetch` and stores its outcome, unless a fetch for this slot is
    /// already in flight. Then the caller gets that fetch's outcome instead,
    /// and only fetches itself if the shared result was invalidated
    /// mid-flight. Dropping the future abandons the fetch without storing
    /// anything.
    pub async fn fetch_shared<F, Fut>(&self, mut fetch: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        loop {
            if let Some(ticket) = self.try_begin_fetch() {
                let in_flight = InFlight {
                    slot: self,
                    ticket: Some(ticket),
                };
                let result = fetch().await;
                in_flight.complete(result.clone());
                return result;
            }

            let settled = self.settled().await;
            match (settled.error, settled.data) {
                (Some(err), _) => return Err(err),
                (None, Some(data)) if !settled.stale => return Ok(data),
                _ => continue,
            }
        }
    }

    async fn settled(&self) -> SlotState<T> {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| !state.fetching).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Stores the outcome. Failures keep the previous data so the UI can show
    /// both the last good value and the error.
    pub fn complete_fetch(&self, ticket: FetchTicket, result: EngineResult<T>) {
        self.state.send_modify(|state| {
            state.fetching = false;
            match result {
                Ok(data) => {
                    state.data = Some(data);
                    state.error = None;
                    state.generation += 1;
                    state.updated_at = Some(Utc::now());
                    state.stale = state.invalidations != ticket.invalidations;
                }
                Err(err) => state.error = Some(err),
            }
        });
    }

    /// Marks the slot stale and wakes whoever refetches it.
    pub fn invalidate(&self) {
        self.state.send_modify(|state| {
            state.stale = true;
            state.invalidations += 1;
        });
        self.invalidated.notify_waiters();
    }

    /// Drops cached data so the next reader starts from "not yet fetched".
    pub fn reset(&self) {
        self.state.send_modify(|state| {
            let invalidations = state.invalidations + 1;
            *state = SlotState {
                invalidations,
                ..SlotState::default()
            };
        });
        self.invalidated.notify_waiters();
    }

    pub async fn invalidated(&self) {
        self.invalidated.notified().await
    }
}

struct InFlight<'a, T: Clone> {
    slot: &'a Slot<T>,
    ticket: Option<FetchTicket>,
}

impl<T: Clone> InFlight<'_, T> {
    fn complete(mut self, result: EngineResult<T>) {
        if let Some(ticket) = self.ticket.take() {
            self.slot.complete_fetch(ticket, result);
        }
    }
}

impl<T: Clone> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.slot.abandon_fetch(ticket);
        }
    }
}

/// The injectable store behind every cached view.
#[derive(Debug)]
pub struct QueryCache {
    sessions: Arc<Slot<Vec<Session>>>,
    products: Arc<Slot<Vec<Product>>>,
    wallet: Arc<Slot<WalletBalance>>,
    logs: DashMap<String, Arc<Slot<String>>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Slot::new(CacheKey::Sessions)),
            products: Arc::new(Slot::new(CacheKey::Products)),
            wallet: Arc::new(Slot::new(CacheKey::Wallet)),
            logs: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> Arc<Slot<Vec<Session>>> {
        Arc::clone(&self.sessions)
    }

    pub fn products(&self) -> Arc<Slot<Vec<Product>>> {
        Arc::clone(&self.products)
    }

    pub fn wallet(&self) -> Arc<Slot<WalletBalance>> {
        Arc::clone(&self.wallet)
    }

    /// Log slot for `session_id`, created on first use.
    pub fn session_log(&self, session_id: &str) -> Arc<Slot<String>> {
        self.logs
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new(CacheKey::SessionLog(session_id.to_string()))))
            .clone()
    }

    pub fn existing_session_log(&self, session_id: &str) -> Option<Arc<Slot<String>>> {
        self.logs.get(session_id).map(|slot| slot.clone())
    }

    /// Resets the log slot of a freshly created session.
    pub fn seed_session_log(&self, session_id: &str) -> Arc<Slot<String>> {
        let slot = self.session_log(session_id);
        slot.reset();
        slot
    }

    pub fn forget_session_log(&self, session_id: &str) {
        self.logs.remove(session_id);
    }

    /// Invalidates exactly the slot named by `key`. Log slots that were never
    /// created are left alone.
    pub fn invalidate(&self, key: &CacheKey) {
        match key {
            CacheKey::Sessions => self.sessions.invalidate(),
            CacheKey::Products => self.products.invalidate(),
            CacheKey::Wallet => self.wallet.invalidate(),
            CacheKey::SessionLog(session_id) => {
                if let Some(slot) = self.existing_session_log(session_id) {
                    slot.invalidate();
                }
            }
        }
    }
}
