use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};
use vpsdeck_common::{CreateSessionRequest, Product, Session};

use crate::error::{EngineError, EngineResult};
use crate::idempotency::KeyGenerator;
use crate::transport::Backend;
use crate::variant::{Variant, product_for_variant};

/// One logical launch. Submitting it again is a retry, not a new purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub variant: Variant,
    pub body: CreateSessionRequest,
}

impl LaunchRequest {
    pub fn idempotency_key(&self) -> &str {
        &self.body.idempotency_key
    }

    pub fn product_id(&self) -> &str {
        &self.body.product_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub session_id: String,
    pub idempotency_key: String,
}

pub struct MutationClient {
    backend: Arc<dyn Backend>,
    keys: Arc<dyn KeyGenerator>,
}

impl MutationClient {
    pub fn new(backend: Arc<dyn Backend>, keys: Arc<dyn KeyGenerator>) -> Self {
        Self { backend, keys }
    }

    /// Picks the catalog product for `variant` and draws a fresh key.
    ///
    /// Fails locally, without touching the network, when no active product
    /// provisions the variant.
    pub fn prepare_launch(&self, variant: Variant, products: &[Product]) -> EngineResult<LaunchRequest> {
        let product = product_for_variant(products, variant)
            .ok_or(EngineError::NoProductConfigured { variant })?;
        let vm_type = variant
            .vm_type()
            .ok_or(EngineError::NoProductConfigured { variant })?;

        Ok(LaunchRequest {
            variant,
            body: CreateSessionRequest {
                product_id: product.id.clone(),
                vm_type: vm_type.to_string(),
                idempotency_key: self.keys.next_key(),
            },
        })
    }

    pub async fn submit_launch(&self, request: &LaunchRequest) -> EngineResult<Session> {
        info!(
            "launching {} session (product {}, key {})",
            request.variant,
            request.product_id(),
            request.idempotency_key()
        );
        let result = self.backend.create_session(&request.body).await;
        match &result {
            Ok(session) => info!("session {} created with status {}", session.id, session.status),
            Err(err) => warn!("launch failed: {}", err),
        }
        result
    }

    pub fn prepare_stop(&self, session_id: &str) -> StopRequest {
        StopRequest {
            session_id: session_id.to_string(),
            idempotency_key: self.keys.next_key(),
        }
    }

    /// Stopping an already stopped session is not an error; the server's
    /// reported status is returned as-is.
    pub async fn submit_stop(&self, request: &StopRequest) -> EngineResult<Session> {
        info!("stopping session {}", request.session_id);
        let result = self
            .backend
            .stop_session(&request.session_id, &request.idempotency_key)
            .await;
        match &result {
            Ok(session) => info!("session {} now {}", session.id, session.status),
            Err(err) => warn!("stop of {} failed: {}", request.session_id, err),
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Launch,
    Stop(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum MutationState {
    #[default]
    Idle,
    Pending,
    Succeeded(Session),
    Failed(EngineError),
}

impl MutationState {
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationState::Pending)
    }
}

/// Per-trigger state for button disabling and toasts. A stop of one session
/// has its own entry and never shares state with a launch or another stop.
#[derive(Debug, Default)]
pub struct MutationTracker {
    states: DashMap<MutationKind, watch::Sender<MutationState>>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, kind: &MutationKind) -> watch::Sender<MutationState> {
        self.states
            .entry(kind.clone())
            .or_insert_with(|| watch::channel(MutationState::Idle).0)
            .clone()
    }

    pub fn subscribe(&self, kind: &MutationKind) -> watch::Receiver<MutationState> {
        self.sender(kind).subscribe()
    }

    pub fn state(&self, kind: &MutationKind) -> MutationState {
        self.states
            .get(kind)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default()
    }

    /// Moves `kind` to `Pending` unless it already is. Returns whether this
    /// caller claimed it; the check and the transition are one step.
    pub fn begin(&self, kind: &MutationKind) -> bool {
        self.sender(kind).send_if_modified(|state| {
            if state.is_pending() {
                return false;
            }
            *state = MutationState::Pending;
            true
        })
    }

    pub fn set(&self, kind: &MutationKind, state: MutationState) {
        self.sender(kind).send_replace(state);
    }

    pub fn record<T>(&self, kind: &MutationKind, result: &EngineResult<T>, session: impl FnOnce(&T) -> Session) {
        let state = match result {
            Ok(value) => MutationState::Succeeded(session(value)),
            Err(err) => MutationState::Failed(err.clone()),
        };
        self.set(kind, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockBackend, SequentialKeys, product};
    use serde_json::json;

    fn client(backend: Arc<MockBackend>) -> MutationClient {
        MutationClient::new(backend, Arc::new(SequentialKeys::new("key")))
    }

    #[test]
    fn test_prepare_resolves_product_for_variant() {
        let backend = MockBackend::new();
        let client = client(backend.clone());
        let catalog = vec![product("p1", json!(1)), product("p2", json!(2))];

        let request = client.prepare_launch(Variant::Windows, &catalog).unwrap();

        assert_eq!(request.product_id(), "p2");
        assert_eq!(request.body.vm_type, "windows");
        assert_eq!(request.idempotency_key(), "key-1");
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_missing_product_fails_before_network() {
        let backend = MockBackend::new();
        let client = client(backend.clone());
        let catalog = vec![product("p1", json!(1))];

        let err = client.prepare_launch(Variant::Windows, &catalog).unwrap_err();

        assert_eq!(err, EngineError::NoProductConfigured { variant: Variant::Windows });
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resubmitting_reuses_the_key() {
        let backend = MockBackend::new();
        backend.fail_next_create(EngineError::Transport("request timed out".into()));
        let client = client(backend.clone());
        let catalog = vec![product("p1", json!(1))];

        let request = client.prepare_launch(Variant::Linux, &catalog).unwrap();
        assert!(client.submit_launch(&request).await.is_err());
        let session = client.submit_launch(&request).await.unwrap();

        let keys = backend.create_keys();
        assert_eq!(keys, vec!["key-1".to_string(), "key-1".to_string()]);
        assert_eq!(backend.sessions().len(), 1);
        assert_eq!(session.status.as_str(), "pending");
    }

    #[tokio::test]
    async fn test_separate_launches_get_distinct_keys() {
        let backend = MockBackend::new();
        let client = client(backend.clone());
        let catalog = vec![product("p1", json!(1))];

        for _ in 0..2 {
            let request = client.prepare_launch(Variant::Linux, &catalog).unwrap();
            client.submit_launch(&request).await.unwrap();
        }

        assert_eq!(backend.create_keys(), vec!["key-1".to_string(), "key-2".to_string()]);
        assert_eq!(backend.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_stop_reports_server_status() {
        let backend = MockBackend::new();
        backend.insert_session(crate::test_support::session("s1", "ready", true));
        let client = client(backend.clone());

        let first = client.submit_stop(&client.prepare_stop("s1")).await.unwrap();
        let second = client.submit_stop(&client.prepare_stop("s1")).await.unwrap();

        assert_eq!(first.status.as_str(), "deleted");
        assert_eq!(second.status.as_str(), "deleted");
    }

    #[test]
    fn test_tracker_keeps_stops_independent() {
        let tracker = MutationTracker::new();
        let stop_a = MutationKind::Stop("a".into());
        let stop_b = MutationKind::Stop("b".into());

        tracker.set(&stop_a, MutationState::Pending);

        assert!(tracker.state(&stop_a).is_pending());
        assert_eq!(tracker.state(&stop_b), MutationState::Idle);
        assert_eq!(tracker.state(&MutationKind::Launch), MutationState::Idle);
    }

    #[test]
    fn test_begin_claims_only_once_until_settled() {
        let tracker = MutationTracker::new();
        let launch = MutationKind::Launch;

        assert!(tracker.begin(&launch));
        assert!(!tracker.begin(&launch));
        assert!(tracker.begin(&MutationKind::Stop("a".into())));

        tracker.set(&launch, MutationState::Failed(EngineError::Transport("request timed out".into())));
        assert!(tracker.begin(&launch));
    }
}
