use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use vpsdeck_common::{
    Availability, CreateSessionRequest, Product, ProductRef, RedeemResponse, Session,
    SessionStatus, WalletBalance,
};

use crate::error::{EngineError, EngineResult};
use crate::idempotency::KeyGenerator;
use crate::transport::Backend;

/// Deterministic keys: `prefix-1`, `prefix-2`, ...
#[derive(Debug)]
pub struct SequentialKeys {
    prefix: String,
    counter: AtomicUsize,
}

impl SequentialKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl KeyGenerator for SequentialKeys {
    fn next_key(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListProducts,
    Availability(Option<String>),
    ListSessions,
    GetSession(String),
    Create(CreateSessionRequest),
    Stop { session_id: String, key: String },
    FetchLog(String),
    Wallet,
    Redeem(String),
}

/// In-memory backend that records every call and dedupes creates by key the
/// way the real server does.
#[derive(Debug, Default)]
pub struct MockBackend {
    products: Mutex<Vec<Product>>,
    sessions: Mutex<Vec<Session>>,
    logs: Mutex<HashMap<String, String>>,
    by_key: Mutex<HashMap<String, String>>,
    wallet: Mutex<i64>,
    calls: Mutex<Vec<Call>>,
    create_failures: Mutex<VecDeque<EngineError>>,
    log_failures: Mutex<VecDeque<EngineError>>,
    log_delay: Mutex<Option<Duration>>,
    logs_in_flight: AtomicUsize,
    max_logs_in_flight: AtomicUsize,
    // `Some(reason)` makes every availability check report no capacity.
    no_capacity: Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_products(products: Vec<Product>) -> Arc<Self> {
        let backend = Self::default();
        *backend.products.lock().unwrap() = products;
        Arc::new(backend)
    }

    pub fn insert_session(&self, session: Session) {
        self.sessions.lock().unwrap().push(session);
    }

    pub fn set_status(&self, session_id: &str, status: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = SessionStatus::from(status);
        }
    }

    pub fn set_log(&self, session_id: &str, text: &str) {
        self.logs
            .lock()
            .unwrap()
            .insert(session_id.to_string(), text.to_string());
    }

    pub fn set_wallet(&self, balance: i64) {
        *self.wallet.lock().unwrap() = balance;
    }

    pub fn fail_next_create(&self, err: EngineError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_log(&self, err: EngineError) {
        self.log_failures.lock().unwrap().push_back(err);
    }

    /// Every later log fetch takes `delay` (on tokio's clock) to answer.
    pub fn set_log_delay(&self, delay: Duration) {
        *self.log_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_no_capacity(&self, reason: &str) {
        *self.no_capacity.lock().unwrap() = Some(reason.to_string());
    }

    /// Highest number of log fetches that were outstanding at once.
    pub fn max_concurrent_log_fetches(&self) -> usize {
        self.max_logs_in_flight.load(Ordering::SeqCst)
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|recorded| *recorded == call).count()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn log_fetches(&self, session_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::FetchLog(id) if id == session_id))
            .count()
    }

    pub fn create_keys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create(request) => Some(request.idempotency_key),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn list_products(&self) -> EngineResult<Vec<Product>> {
        self.record(Call::ListProducts);
        Ok(self.products.lock().unwrap().clone())
    }

    async fn availability(&self, product_id: Option<&str>) -> EngineResult<Availability> {
        self.record(Call::Availability(product_id.map(str::to_string)));
        let reason = self.no_capacity.lock().unwrap().clone();
        Ok(Availability {
            available: reason.is_none(),
            reason,
            ..Default::default()
        })
    }

    async fn list_sessions(&self) -> EngineResult<Vec<Session>> {
        self.record(Call::ListSessions);
        Ok(self.sessions())
    }

    async fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        self.record(Call::GetSession(session_id.to_string()));
        self.sessions()
            .into_iter()
            .find(|s| s.id == session_id)
            .ok_or_else(|| EngineError::Validation {
                status: 404,
                detail: "Session not found".into(),
            })
    }

    async fn create_session(&self, request: &CreateSessionRequest) -> EngineResult<Session> {
        self.record(Call::Create(request.clone()));
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let existing = self
            .by_key
            .lock()
            .unwrap()
            .get(&request.idempotency_key)
            .cloned();
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(id) = existing {
            if let Some(session) = sessions.iter().find(|s| s.id == id) {
                return Ok(session.clone());
            }
        }

        let session = Session {
            product: Some(ProductRef {
                id: request.product_id.clone(),
                ..Default::default()
            }),
            created_at: Some(chrono::Utc::now()),
            ..Session::new(format!("s{}", sessions.len() + 1), SessionStatus::Pending)
        };
        self.by_key
            .lock()
            .unwrap()
            .insert(request.idempotency_key.clone(), session.id.clone());
        sessions.push(session.clone());
        Ok(session)
    }

    async fn stop_session(&self, session_id: &str, idempotency_key: &str) -> EngineResult<Session> {
        self.record(Call::Stop {
            session_id: session_id.to_string(),
            key: idempotency_key.to_string(),
        });
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| EngineError::Validation {
                status: 404,
                detail: "Session not found".into(),
            })?;
        session.status = SessionStatus::Deleted;
        session.worker_route = None;
        session.has_log = false;
        session.rdp = None;
        Ok(session.clone())
    }

    async fn fetch_log(&self, session_id: &str) -> EngineResult<String> {
        self.record(Call::FetchLog(session_id.to_string()));
        let now = self.logs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_logs_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.log_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.logs_in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.log_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn wallet_balance(&self) -> EngineResult<WalletBalance> {
        self.record(Call::Wallet);
        Ok(WalletBalance {
            balance: *self.wallet.lock().unwrap(),
        })
    }

    async fn redeem_gift_code(&self, code: &str) -> EngineResult<RedeemResponse> {
        self.record(Call::Redeem(code.to_string()));
        if code != "WELCOME" {
            return Err(EngineError::Validation {
                status: 400,
                detail: "Invalid gift code".into(),
            });
        }
        let mut wallet = self.wallet.lock().unwrap();
        *wallet += 50;
        Ok(RedeemResponse {
            ok: true,
            message: Some("Redeemed".into()),
            added: Some(50),
            balance: Some(*wallet),
            ..Default::default()
        })
    }
}

pub fn product(id: &str, action: Value) -> Product {
    Product {
        id: id.to_string(),
        name: format!("Product {}", id),
        price_coins: 20,
        provision_action: Some(action),
        ..Default::default()
    }
}

/// Session with log capability toggled by `has_log`.
pub fn session(id: &str, status: &str, has_log: bool) -> Session {
    Session {
        has_log,
        worker_route: has_log.then(|| format!("route-{}", id)),
        created_at: Some(chrono::Utc::now()),
        ..Session::new(id, SessionStatus::from(status))
    }
}
