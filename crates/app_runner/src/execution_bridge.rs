use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use core_types::{
    Blockhash, ExecutionRequest, LedgerExecutionClient, LedgerRpc, PoolKind, PoolRef,
    PoolResolver, PreparedTransaction,
};
use infra_clock::SharedClock;
use ledger_gateway::{mask_endpoint, LedgerGateway};
use paper_ledger::DryRunLedger;
use serde::Serialize;

use crate::config_loader::{ExecutionSection, ServiceConfig};

/// The three ledger-facing ports the context is built from.
#[derive(Clone)]
pub(crate) struct LedgerPorts {
    pub(crate) ledger: Arc<dyn LedgerRpc>,
    pub(crate) executor: Arc<dyn LedgerExecutionClient>,
    pub(crate) pools: Arc<dyn PoolResolver>,
    /// Present when reads go through the resilient gateway.
    pub(crate) gateway: Option<Arc<LedgerGateway>>,
}

pub(crate) fn build_ledger_ports(cfg: &ServiceConfig, clock: SharedClock) -> Result<LedgerPorts> {
    let gateway = Arc::new(
        LedgerGateway::new(cfg.gateway.clone(), clock).context("build ledger gateway")?,
    );

    if cfg.execution.mode.is_dry_run() {
        tracing::warn!("execution.mode=paper: transactions are simulated locally, nothing is sent");
        let dry = Arc::new(DryRunLedger::new(
            gateway.clone(),
            cfg.ledger.fee_account.clone(),
        ));
        return Ok(LedgerPorts {
            ledger: dry.clone(),
            executor: dry.clone(),
            pools: dry,
            gateway: Some(gateway),
        });
    }

    let bridge = Arc::new(HttpExecutionClient::new(&cfg.execution)?);
    Ok(LedgerPorts {
        ledger: gateway.clone(),
        executor: bridge.clone(),
        pools: bridge,
        gateway: Some(gateway),
    })
}

#[derive(Serialize)]
struct BuildRequest<'a> {
    request: &'a ExecutionRequest,
    blockhash: &'a Blockhash,
}

/// Forwards transaction building and pool lookup to an external builder service.
pub(crate) struct HttpExecutionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpExecutionClient {
    pub(crate) fn new(cfg: &ExecutionSection) -> Result<Self> {
        let endpoint = cfg.builder_endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            bail!("execution.builder_endpoint is empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .context("build execution http client")?;
        tracing::info!(endpoint = %mask_endpoint(&endpoint), "execution bridge ready");
        Ok(Self { http, endpoint })
    }
}

/// A builder response must carry a non-empty plan and a decodable payload.
pub(crate) fn check_prepared(prepared: &PreparedTransaction) -> Result<()> {
    if prepared.instructions.is_empty() {
        bail!("builder returned an empty instruction plan");
    }
    let bytes = B64
        .decode(prepared.payload.as_bytes())
        .context("builder payload is not base64")?;
    if bytes.is_empty() {
        bail!("builder returned an empty payload");
    }
    Ok(())
}

#[async_trait]
impl LedgerExecutionClient for HttpExecutionClient {
    async fn build_transaction(
        &self,
        request: &ExecutionRequest,
        blockhash: &Blockhash,
    ) -> Result<PreparedTransaction> {
        let resp = self
            .http
            .post(format!("{}/build", self.endpoint))
            .json(&BuildRequest { request, blockhash })
            .send()
            .await
            .context("send build request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("builder rejected {}: http {status}: {text}", request.symbol);
        }
        let prepared = resp
            .json::<PreparedTransaction>()
            .await
            .context("decode builder response")?;
        check_prepared(&prepared)?;
        Ok(prepared)
    }
}

#[async_trait]
impl PoolResolver for HttpExecutionClient {
    async fn resolve_pool(&self, asset_address: &str) -> Result<PoolRef> {
        let resp = self
            .http
            .get(format!("{}/pool/{asset_address}", self.endpoint))
            .send()
            .await
            .context("send pool request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("pool lookup for {asset_address} failed: http {status}");
        }
        resp.json::<PoolRef>()
            .await
            .context("decode pool response")
    }

    fn derived_pool(&self, asset_address: &str) -> PoolRef {
        PoolRef {
            address: format!("{}:{asset_address}", PoolKind::BondingCurve),
            kind: PoolKind::BondingCurve,
        }
    }
}
