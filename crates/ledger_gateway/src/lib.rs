use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine as _;
use core_types::{
    AssetMetadata, Blockhash, Confirmation, LedgerRpc, SignatureInfo, SimulationResult,
    TransactionDetail, Units,
};
use infra_clock::SharedClock;
use observability::short_address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod breaker;
pub mod decode;
pub mod error;
pub mod health;
pub mod pool;
pub mod transport;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use error::{GatewayError, RpcError, RpcErrorKind};
pub use health::GatewayHealth;
pub use pool::mask_endpoint;
pub use transport::{HttpTransport, RpcTransport};

use health::HealthTracker;
use pool::EndpointPool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub endpoints: Vec<String>,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub latency_window: usize,
    pub commitment: String,
    pub confirm_poll_ms: u64,
    pub confirm_timeout_ms: u64,
    pub asset_page_limit: usize,
    pub asset_max_pages: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            request_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            latency_window: 100,
            commitment: "confirmed".to_string(),
            confirm_poll_ms: 2_000,
            confirm_timeout_ms: 90_000,
            asset_page_limit: 1_000,
            asset_max_pages: 10,
        }
    }
}

/// Resilient access to the ledger: every call passes the breaker, is retried
/// with exponential backoff on transient errors and fails over between endpoints.
pub struct LedgerGateway<T: RpcTransport = HttpTransport> {
    cfg: GatewayConfig,
    transport: T,
    pool: EndpointPool,
    breaker: Mutex<CircuitBreaker>,
    health: HealthTracker,
    clock: SharedClock,
}

impl LedgerGateway<HttpTransport> {
    pub fn new(cfg: GatewayConfig, clock: SharedClock) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_millis(cfg.request_timeout_ms))?;
        Self::with_transport(cfg, transport, clock)
    }
}

impl<T: RpcTransport> LedgerGateway<T> {
    pub fn with_transport(cfg: GatewayConfig, transport: T, clock: SharedClock) -> Result<Self> {
        let endpoints = cfg
            .endpoints
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>();
        if endpoints.is_empty() {
            bail!(GatewayError::Config("no rpc endpoints configured".to_string()));
        }
        tracing::info!(
            endpoints = ?endpoints.iter().map(|e| mask_endpoint(e)).collect::<Vec<_>>(),
            "ledger gateway ready"
        );
        Ok(Self {
            pool: EndpointPool::new(endpoints),
            breaker: Mutex::new(CircuitBreaker::new(cfg.breaker.clone())),
            health: HealthTracker::new(cfg.latency_window),
            cfg,
            transport,
            clock,
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state()
    }

    pub fn health(&self) -> GatewayHealth {
        let stats = self.health.stats();
        let circuit = self.circuit_state();
        GatewayHealth {
            active_endpoint: self.pool.masked_current(),
            endpoint_count: self.pool.len(),
            circuit,
            total_requests: stats.total,
            total_failures: stats.failures,
            failovers: self.pool.failover_count(),
            error_rate: stats.error_rate,
            avg_latency_ms: stats.avg_ms,
            p50_latency_ms: stats.p50_ms,
            p95_latency_ms: stats.p95_ms,
            healthy: circuit == CircuitState::Closed,
        }
    }

    /// Run `op` against the active endpoint under the breaker, retry and failover policy.
    pub async fn execute<R, F, Fut>(&self, method: &str, op: F) -> Result<R, GatewayError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<R, RpcError>>,
    {
        let max_retries = self.cfg.retry.max_retries;
        let mut last_err: Option<RpcError> = None;

        for attempt in 0..=max_retries {
            let permit = match self.breaker.lock().try_acquire(self.clock.now_ms()) {
                Ok(permit) => permit,
                Err(retry_in_ms) => {
                    metrics::counter!("gateway.circuit_open").increment(1);
                    return Err(GatewayError::CircuitOpen { retry_in_ms });
                }
            };

            let (idx, endpoint) = self.pool.current();
            let endpoint = endpoint.to_string();
            metrics::counter!("gateway.requests", "method" => method.to_string()).increment(1);
            let started = Instant::now();
            let result = op(endpoint.clone()).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            metrics::histogram!("gateway.latency_ms").record(latency_ms as f64);

            match result {
                Ok(value) => {
                    self.breaker.lock().on_success(permit);
                    self.health.record(latency_ms, true);
                    return Ok(value);
                }
                Err(err) => {
                    self.health.record(latency_ms, false);
                    metrics::counter!("gateway.failures", "method" => method.to_string())
                        .increment(1);
                    if !err.is_transient() {
                        self.breaker.lock().release(permit);
                        return Err(GatewayError::Permanent {
                            method: method.to_string(),
                            source: err,
                        });
                    }
                    self.breaker.lock().on_failure(permit, self.clock.now_ms());
                    tracing::warn!(
                        method,
                        attempt = attempt + 1,
                        endpoint = %mask_endpoint(&endpoint),
                        error = %err,
                        "ledger call failed"
                    );

                    let failed_over = err.triggers_failover() && self.pool.failover(idx);
                    if failed_over {
                        metrics::counter!("gateway.failovers").increment(1);
                        tracing::info!(
                            from = %mask_endpoint(&endpoint),
                            to = %self.pool.masked_current(),
                            "ledger endpoint failover"
                        );
                    }
                    last_err = Some(err);
                    // a fresh endpoint is tried immediately
                    if attempt < max_retries && !failed_over {
                        tokio::time::sleep(self.cfg.retry.delay_for(attempt + 1)).await;
                    }
                }
            }
        }

        Err(GatewayError::Exhausted {
            method: method.to_string(),
            attempts: max_retries + 1,
            last: last_err.unwrap_or_else(|| RpcError::decode("no attempt made")),
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.execute(method, |endpoint| {
            let params = params.clone();
            async move { self.transport.call(&endpoint, method, params).await }
        })
        .await
    }

    async fn call_decoded<R>(
        &self,
        method: &str,
        params: Value,
        decode: impl Fn(Value) -> Result<R, RpcError>,
    ) -> Result<R, GatewayError> {
        self.execute(method, |endpoint| {
            let params = params.clone();
            let decode = &decode;
            async move {
                let value = self.transport.call(&endpoint, method, params).await?;
                decode(value)
            }
        })
        .await
    }

    fn commitment(&self) -> Value {
        json!({ "commitment": self.cfg.commitment })
    }

    fn check_payload(payload: &str) -> Result<(), GatewayError> {
        let ok = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map(|bytes| !bytes.is_empty())
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(GatewayError::Permanent {
                method: "payload".to_string(),
                source: RpcError::decode("transaction payload is not non-empty base64"),
            })
        }
    }
}

#[async_trait]
impl<T: RpcTransport> LedgerRpc for LedgerGateway<T> {
    async fn get_slot(&self) -> Result<u64> {
        Ok(self
            .call_decoded("getSlot", json!([self.commitment()]), decode::slot)
            .await?)
    }

    async fn get_balance(&self, address: &str) -> Result<Units> {
        Ok(self
            .call_decoded(
                "getBalance",
                json!([address, self.commitment()]),
                decode::balance,
            )
            .await?)
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>> {
        let mut opts = json!({
            "limit": limit.clamp(1, 1_000),
            "commitment": self.cfg.commitment,
        });
        if let Some(until) = until {
            opts["until"] = json!(until);
        }
        Ok(self
            .call_decoded(
                "getSignaturesForAddress",
                json!([address, opts]),
                decode::signatures,
            )
            .await?)
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionDetail>> {
        let params = json!([signature, {
            "encoding": "jsonParsed",
            "maxSupportedTransactionVersion": 0,
            "commitment": self.cfg.commitment,
        }]);
        Ok(self
            .call_decoded("getTransaction", params, |v| {
                decode::transaction(signature, v)
            })
            .await?)
    }

    async fn get_assets_by_authority(&self, authority: &str) -> Result<Vec<AssetMetadata>> {
        let limit = self.cfg.asset_page_limit.max(1);
        let mut out = Vec::new();
        for page in 1..=self.cfg.asset_max_pages.max(1) {
            let params = json!({
                "authorityAddress": authority,
                "page": page,
                "limit": limit,
            });
            let items = self
                .call_decoded("getAssetsByAuthority", params, decode::asset_page)
                .await?;
            let done = items.len() < limit;
            out.extend(items);
            if done {
                break;
            }
        }
        tracing::debug!(authority = %short_address(authority), count = out.len(), "assets by authority");
        Ok(out)
    }

    async fn get_asset_metadata(&self, address: &str) -> Result<Option<AssetMetadata>> {
        match self
            .call_decoded("getAsset", json!({ "id": address }), decode::asset)
            .await
        {
            Ok(meta) => Ok(meta),
            Err(GatewayError::Permanent { source, .. })
                if source.kind == RpcErrorKind::Rpc
                    && source.message.to_ascii_lowercase().contains("not found") =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_latest_blockhash(&self) -> Result<Blockhash> {
        Ok(self
            .call_decoded(
                "getLatestBlockhash",
                json!([self.commitment()]),
                decode::blockhash,
            )
            .await?)
    }

    async fn simulate_transaction(&self, payload: &str) -> Result<SimulationResult> {
        Self::check_payload(payload)?;
        let params = json!([payload, {
            "encoding": "base64",
            "sigVerify": false,
            "commitment": self.cfg.commitment,
        }]);
        Ok(self
            .call_decoded("simulateTransaction", params, decode::simulation)
            .await?)
    }

    async fn send_transaction(&self, payload: &str) -> Result<String> {
        Self::check_payload(payload)?;
        // already simulated; resubmission is ours to control
        let params = json!([payload, {
            "encoding": "base64",
            "skipPreflight": true,
            "maxRetries": 0,
        }]);
        Ok(self
            .call_decoded("sendTransaction", params, decode::sent_signature)
            .await?)
    }

    async fn confirm_transaction(
        &self,
        signature: &str,
        blockhash: &Blockhash,
    ) -> Result<Confirmation> {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.confirm_timeout_ms);
        let poll = Duration::from_millis(self.cfg.confirm_poll_ms.max(1));
        loop {
            let status = self
                .call_decoded(
                    "getSignatureStatuses",
                    json!([[signature], { "searchTransactionHistory": false }]),
                    decode::signature_status,
                )
                .await?;
            if let Some(status) = status {
                if let Some(failure) = status.failure() {
                    return Ok(Confirmation::Failed(failure));
                }
                if status.is_confirmed() {
                    return Ok(Confirmation::Confirmed);
                }
            }

            let height = self
                .call_decoded("getBlockHeight", json!([self.commitment()]), decode::slot)
                .await?;
            if height > blockhash.last_valid_block_height || Instant::now() >= deadline {
                tracing::warn!(
                    signature = %short_address(signature),
                    height,
                    last_valid = blockhash.last_valid_block_height,
                    "transaction expired before confirmation"
                );
                return Ok(Confirmation::Expired);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests;
