use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::time;
use tracing::{debug, warn};
use vpsdeck_common::{
    Availability, CreateSessionRequest, ErrorBody, Product, RedeemRequest, RedeemResponse,
    Session, SessionEnvelope, SessionList, WalletBalance,
};

use crate::config::{BACKEND_ENV, HTTP_TIMEOUT_SECS, MAX_NETWORK_RETRIES, RETRY_DELAY_MS, USER_AGENT};
use crate::error::{EngineError, EngineResult};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// The backend collaborator as seen by the engine.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_products(&self) -> EngineResult<Vec<Product>>;

    /// Capacity pre-check for one product, or the whole catalog with `None`.
    async fn availability(&self, product_id: Option<&str>) -> EngineResult<Availability>;

    async fn list_sessions(&self) -> EngineResult<Vec<Session>>;

    async fn get_session(&self, session_id: &str) -> EngineResult<Session>;

    async fn create_session(&self, request: &CreateSessionRequest) -> EngineResult<Session>;

    async fn stop_session(&self, session_id: &str, idempotency_key: &str) -> EngineResult<Session>;

    /// Raw log tail; an empty string is a valid log.
    async fn fetch_log(&self, session_id: &str) -> EngineResult<String>;

    async fn wallet_balance(&self) -> EngineResult<WalletBalance>;

    async fn redeem_gift_code(&self, code: &str) -> EngineResult<RedeemResponse>;
}

/// `Backend` over the REST API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn build_client() -> anyhow::Result<Client> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS));

        // Scripted test servers answer one request per connection.
        if std::env::var(BACKEND_ENV).is_ok() {
            builder = builder.pool_max_idle_per_host(0).pool_idle_timeout(None);
        }

        builder.build().context("create http client")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `base_url` extended by `segments`, each percent-encoded as one path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> EngineResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| EngineError::Transport(format!("invalid backend url: {}", err)))?;
        url.path_segments_mut()
            .map_err(|_| EngineError::Transport("invalid backend url".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<F>(&self, make_request: F) -> EngineResult<Response>
    where
        F: FnMut() -> RequestBuilder,
    {
        let resp = send_with_retries(make_request).await?;
        Self::check(resp).await
    }

    /// A single attempt; the caller owns any retry schedule.
    async fn send_once(request: RequestBuilder) -> EngineResult<Response> {
        let resp = request.send().await?;
        Self::check(resp).await
    }

    async fn check(resp: Response) -> EngineResult<Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(classify_failure(resp).await)
        }
    }

    async fn json<T: DeserializeOwned>(resp: Response) -> EngineResult<T> {
        resp.json::<T>().await.map_err(|err| {
            warn!("failed to parse backend response: {}", err);
            EngineError::Transport("unexpected response from backend".to_string())
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_products(&self) -> EngineResult<Vec<Product>> {
        let url = self.endpoint(&["vps", "products"])?;
        let resp = self.send(|| self.authorize(self.client.get(url.clone()))).await?;
        Self::json(resp).await
    }

    async fn availability(&self, product_id: Option<&str>) -> EngineResult<Availability> {
        let mut url = self.endpoint(&["vps", "availability"])?;
        if let Some(product_id) = product_id {
            url.query_pairs_mut().append_pair("product_id", product_id);
        }
        let resp = self.send(|| self.authorize(self.client.get(url.clone()))).await?;
        Self::json(resp).await
    }

    async fn list_sessions(&self) -> EngineResult<Vec<Session>> {
        let url = self.endpoint(&["vps", "sessions"])?;
        let resp = self.send(|| self.authorize(self.client.get(url.clone()))).await?;
        Ok(Self::json::<SessionList>(resp).await?.into_sessions())
    }

    async fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        let url = self.endpoint(&["vps", "sessions", session_id])?;
        let resp = self.send(|| self.authorize(self.client.get(url.clone()))).await?;
        Ok(Self::json::<SessionEnvelope>(resp).await?.into_session())
    }

    async fn create_session(&self, request: &CreateSessionRequest) -> EngineResult<Session> {
        let url = self.endpoint(&["vps", "sessions"])?;
        // Every retry below re-sends the same key.
        let resp = self
            .send(|| {
                self.authorize(self.client.post(url.clone()))
                    .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
                    .json(request)
            })
            .await?;
        Ok(Self::json::<SessionEnvelope>(resp).await?.into_session())
    }

    async fn stop_session(&self, session_id: &str, idempotency_key: &str) -> EngineResult<Session> {
        let url = self.endpoint(&["vps", "sessions", session_id, "stop"])?;
        let resp = self
            .send(|| {
                self.authorize(self.client.post(url.clone()))
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
            })
            .await?;
        Ok(Self::json::<SessionEnvelope>(resp).await?.into_session())
    }

    // Polled on a schedule, so a failure waits for the next tick instead of
    // going through the retry loop.
    async fn fetch_log(&self, session_id: &str) -> EngineResult<String> {
        let url = self.endpoint(&["vps", "sessions", session_id, "log"])?;
        let resp = Self::send_once(self.authorize(self.client.get(url))).await?;
        resp.text().await.map_err(EngineError::from)
    }

    async fn wallet_balance(&self) -> EngineResult<WalletBalance> {
        let url = self.endpoint(&["ads", "wallet"])?;
        let resp = self.send(|| self.authorize(self.client.get(url.clone()))).await?;
        Self::json(resp).await
    }

    async fn redeem_gift_code(&self, code: &str) -> EngineResult<RedeemResponse> {
        let url = self.endpoint(&["giftcodes", "redeem"])?;
        let body = RedeemRequest {
            code: code.trim().to_string(),
        };
        let resp = self
            .send(|| self.authorize(self.client.post(url.clone())).json(&body))
            .await?;
        Self::json(resp).await
    }
}

/// Maps a non-2xx response onto the error taxonomy.
///
/// 4xx responses carrying a `detail` surface it verbatim; everything else is a
/// transport failure.
pub(crate) async fn classify_failure(resp: Response) -> EngineError {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return EngineError::Unauthorized;
    }

    let body = resp.text().await.unwrap_or_default();
    debug!("backend responded {}: {}", status, body);

    if status.is_client_error() {
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|parsed| parsed.detail_text());
        if let Some(detail) = detail {
            return EngineError::Validation {
                status: status.as_u16(),
                detail,
            };
        }
    }

    EngineError::Transport(format!("server responded with {}", status))
}

pub(crate) async fn send_with_retries<F>(mut make_request: F) -> EngineResult<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let mut delay = Duration::from_millis(RETRY_DELAY_MS);
    let mut attempt = 1;
    loop {
        match make_request().send().await {
            Ok(resp) => return Ok(resp),
            Err(err) if attempt < MAX_NETWORK_RETRIES && (err.is_timeout() || err.is_connect()) => {
                warn!(
                    "network request failed (attempt {} of {}): {}",
                    attempt, MAX_NETWORK_RETRIES, err
                );
                time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
