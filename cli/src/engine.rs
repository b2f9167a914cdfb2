use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vpsdeck_common::{Availability, Product, RedeemResponse, Session, WalletBalance};

use crate::cache::{QueryCache, SlotState};
use crate::config::IDLE_LIST_REFRESH_SECS;
use crate::consistency::{self, MutationEvent};
use crate::error::{EngineError, EngineResult};
use crate::idempotency::KeyGenerator;
use crate::lifecycle::{list_refetch_interval, sort_sessions};
use crate::mutation::{LaunchRequest, MutationClient, MutationKind, MutationState, MutationTracker};
use crate::poller::{LogGate, LogPoller, LogView, PollerHandle, fetch_into_slot, log_gate};
use crate::transport::Backend;
use crate::variant::Variant;

/// Session-management engine: one backend, one cache, shared by every view.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn Backend>,
    cache: Arc<QueryCache>,
    mutations: Arc<MutationClient>,
    tracker: Arc<MutationTracker>,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>, keys: Arc<dyn KeyGenerator>) -> Self {
        Self::with_cache(backend, keys, Arc::new(QueryCache::new()))
    }

    pub fn with_cache(backend: Arc<dyn Backend>, keys: Arc<dyn KeyGenerator>, cache: Arc<QueryCache>) -> Self {
        let mutations = Arc::new(MutationClient::new(Arc::clone(&backend), keys));
        Self {
            backend,
            cache,
            mutations,
            tracker: Arc::new(MutationTracker::new()),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Fetches the session list and publishes it sorted. Callers arriving
    /// while a list fetch is outstanding share it.
    pub async fn refresh_sessions(&self) -> EngineResult<Vec<Session>> {
        let result = self
            .cache
            .sessions()
            .fetch_shared(|| {
                let backend = Arc::clone(&self.backend);
                async move {
                    let mut sessions = backend.list_sessions().await?;
                    sort_sessions(&mut sessions);
                    Ok(sessions)
                }
            })
            .await;
        if let Err(err) = &result {
            warn!("session list refresh failed: {}", err);
        }
        result
    }

    pub async fn refresh_products(&self) -> EngineResult<Vec<Product>> {
        self.cache
            .products()
            .fetch_shared(|| self.backend.list_products())
            .await
    }

    /// Catalog from the cache, fetched on demand.
    pub async fn products(&self) -> EngineResult<Vec<Product>> {
        let state = self.cache.products().snapshot();
        match state.data {
            Some(products) if !state.stale => Ok(products),
            _ => self.refresh_products().await,
        }
    }

    pub async fn refresh_wallet(&self) -> EngineResult<WalletBalance> {
        self.cache
            .wallet()
            .fetch_shared(|| self.backend.wallet_balance())
            .await
    }

    /// Capacity for one product, or across the active catalog with `None`.
    pub async fn availability(&self, product_id: Option<&str>) -> EngineResult<Availability> {
        self.backend.availability(product_id).await
    }

    pub fn sessions_view(&self) -> watch::Receiver<SlotState<Vec<Session>>> {
        self.cache.sessions().subscribe()
    }

    pub fn wallet_view(&self) -> watch::Receiver<SlotState<WalletBalance>> {
        self.cache.wallet().subscribe()
    }

    /// The session as last seen in the list slot.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.cache
            .sessions()
            .data()
            .and_then(|sessions| sessions.into_iter().find(|s| s.id == session_id))
    }

    /// One session straight from the backend, without re-listing.
    pub async fn fetch_session(&self, session_id: &str) -> EngineResult<Session> {
        self.backend.get_session(session_id).await
    }

    pub async fn prepare_launch(&self, variant: Variant) -> EngineResult<LaunchRequest> {
        let products = self.products().await?;
        self.mutations.prepare_launch(variant, &products)
    }

    /// Creates a session of `variant` under a fresh idempotency key, after a
    /// capacity pre-check for its product.
    pub async fn launch(&self, variant: Variant) -> EngineResult<Session> {
        let kind = MutationKind::Launch;
        self.tracker.set(&kind, MutationState::Pending);
        let result: EngineResult<Session> = async {
            let request = self.prepare_launch(variant).await?;
            self.check_capacity(&request).await?;
            self.submit_launch(&request).await
        }
        .await;
        self.tracker.record(&kind, &result, Session::clone);
        result
    }

    async fn check_capacity(&self, request: &LaunchRequest) -> EngineResult<()> {
        match self.backend.availability(Some(request.product_id())).await {
            Ok(availability) if !availability.available => {
                let reason = availability
                    .reason
                    .unwrap_or_else(|| "No worker available".to_string());
                info!("product {} has no capacity: {}", request.product_id(), reason);
                Err(EngineError::NoCapacity { reason })
            }
            Ok(_) => Ok(()),
            // The create call still decides; an unanswered pre-check never blocks it.
            Err(err) => {
                warn!("availability check failed: {}", err);
                Ok(())
            }
        }
    }

    /// Resubmits a prepared launch under its original key.
    pub async fn retry_launch(&self, request: &LaunchRequest) -> EngineResult<Session> {
        let kind = MutationKind::Launch;
        self.tracker.set(&kind, MutationState::Pending);
        let result = self.submit_launch(request).await;
        self.tracker.record(&kind, &result, Session::clone);
        result
    }

    async fn submit_launch(&self, request: &LaunchRequest) -> EngineResult<Session> {
        let session = self.mutations.submit_launch(request).await?;
        consistency::apply(
            &self.cache,
            &MutationEvent::Launched {
                session_id: session.id.clone(),
            },
        );
        self.refetch_after_mutation().await;
        Ok(session)
    }

    pub async fn stop(&self, session_id: &str) -> EngineResult<Session> {
        let kind = MutationKind::Stop(session_id.to_string());
        self.tracker.set(&kind, MutationState::Pending);
        let request = self.mutations.prepare_stop(session_id);
        let result = self.mutations.submit_stop(&request).await;
        if result.is_ok() {
            consistency::apply(
                &self.cache,
                &MutationEvent::Stopped {
                    session_id: session_id.to_string(),
                },
            );
            self.refetch_after_mutation().await;
        }
        self.tracker.record(&kind, &result, Session::clone);
        result
    }

    pub async fn redeem_gift_code(&self, code: &str) -> EngineResult<RedeemResponse> {
        let code = code.trim();
        info!("redeeming gift code");
        let response = self.backend.redeem_gift_code(code).await?;
        consistency::apply(&self.cache, &MutationEvent::WalletChanged);
        if let Err(err) = self.refresh_wallet().await {
            warn!("wallet refresh after redeem failed: {}", err);
        }
        Ok(response)
    }

    // The mutation already succeeded; a failed list refetch only leaves the
    // slot stale for the next refresh.
    async fn refetch_after_mutation(&self) {
        if let Err(err) = self.refresh_sessions().await {
            debug!("list refetch after mutation failed: {}", err);
        }
    }

    /// One manual log fetch, skipped for sessions without log capability.
    pub async fn refresh_log(&self, session_id: &str) -> EngineResult<Option<String>> {
        let Some(session) = self.session(session_id) else {
            return Ok(None);
        };
        if log_gate(&session) == LogGate::Unavailable {
            return Ok(None);
        }
        let slot = self.cache.session_log(session_id);
        fetch_into_slot(self.backend.as_ref(), &slot, session_id)
            .await
            .map(Some)
    }

    pub fn log_view(&self, session_id: &str) -> LogView {
        let Some(session) = self.session(session_id) else {
            return LogView::Unavailable;
        };
        let state = self
            .cache
            .existing_session_log(session_id)
            .map(|slot| slot.snapshot());
        LogView::build(&session, state.as_ref())
    }

    pub fn watch_log(&self, session_id: &str) -> PollerHandle {
        LogPoller::spawn(Arc::clone(&self.backend), Arc::clone(&self.cache), session_id)
    }

    /// Claims `kind` for a trigger about to run, so a second press while the
    /// first is still pending is refused.
    pub fn begin(&self, kind: &MutationKind) -> bool {
        self.tracker.begin(kind)
    }

    pub fn mutation_state(&self, kind: &MutationKind) -> MutationState {
        self.tracker.state(kind)
    }

    pub fn subscribe_mutation(&self, kind: &MutationKind) -> watch::Receiver<MutationState> {
        self.tracker.subscribe(kind)
    }

    /// Keeps the session list fresh until cancelled.
    ///
    /// Polls at the shortest interval any listed session asks for, and at a
    /// slow heartbeat once everything is terminal. Invalidations wake it early.
    pub async fn run_session_refresh(&self, cancel: CancellationToken) {
        let slot = self.cache.sessions();
        let mut woken = false;
        loop {
            let invalidations = slot.snapshot().invalidations;
            // A mutation that invalidated the list has usually refetched it too.
            let sessions = if woken && slot.snapshot().is_fresh() {
                slot.data().unwrap_or_default()
            } else {
                match self.refresh_sessions().await {
                    Ok(sessions) => sessions,
                    Err(_) => slot.data().unwrap_or_default(),
                }
            };
            if slot.snapshot().invalidations != invalidations {
                woken = true;
                continue;
            }
            let wait = list_refetch_interval(&sessions)
                .duration()
                .unwrap_or(Duration::from_secs(IDLE_LIST_REFRESH_SECS));
            debug!("next session list refresh in {:?}", wait);

            woken = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = slot.invalidated() => true,
                _ = tokio::time::sleep(wait) => false,
            };
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
