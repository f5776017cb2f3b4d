use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use infra_clock::ManualClock;

#[derive(Default)]
struct Scripted {
    replies: Mutex<VecDeque<Result<Value, RpcError>>>,
    fallback: Mutex<Option<Result<Value, RpcError>>>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl Scripted {
    fn push(&self, reply: Result<Value, RpcError>) {
        self.replies.lock().push_back(reply);
    }

    fn always(&self, reply: Result<Value, RpcError>) {
        *self.fallback.lock() = Some(reply);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RpcTransport for Arc<Scripted> {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        self.calls
            .lock()
            .push((endpoint.to_string(), method.to_string(), params));
        if let Some(reply) = self.replies.lock().pop_front() {
            return reply;
        }
        self.fallback
            .lock()
            .clone()
            .unwrap_or_else(|| Err(RpcError::decode("script exhausted")))
    }
}

fn cfg(endpoints: &[&str]) -> GatewayConfig {
    GatewayConfig {
        endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        retry: RetryPolicy {
            max_retries: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        },
        confirm_poll_ms: 1,
        ..GatewayConfig::default()
    }
}

fn gateway(
    endpoints: &[&str],
    clock: Arc<ManualClock>,
) -> (LedgerGateway<Arc<Scripted>>, Arc<Scripted>) {
    let script = Arc::new(Scripted::default());
    let gw = LedgerGateway::with_transport(cfg(endpoints), script.clone(), clock)
        .expect("gateway");
    (gw, script)
}

fn timeout() -> RpcError {
    RpcError::new(RpcErrorKind::Timeout, "operation timed out")
}

#[test]
fn retry_delays_double_and_cap() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    assert_eq!(policy.delay_for(5), Duration::from_secs(10));
}

#[test]
fn rejects_empty_endpoint_list() {
    let script = Arc::new(Scripted::default());
    let err = LedgerGateway::with_transport(cfg(&[" "]), script, ManualClock::shared(0));
    assert!(err.is_err());
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    script.push(Err(timeout()));
    script.push(Err(RpcError::new(RpcErrorKind::Reset, "connection reset by peer")));
    script.push(Ok(json!(77)));

    assert_eq!(gw.get_slot().await.expect("slot"), 77);
    assert_eq!(script.call_count(), 3);
    assert_eq!(gw.circuit_state(), CircuitState::Closed);
    let health = gw.health();
    assert_eq!(health.total_requests, 3);
    assert_eq!(health.total_failures, 2);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    script.push(Err(RpcError::rpc(-32602, "Invalid params: bad address")));

    let err = gw.get_balance("nope").await.expect_err("permanent");
    assert!(err.to_string().contains("Invalid params"));
    assert_eq!(script.call_count(), 1);
}

#[tokio::test]
async fn exhausting_retries_reports_attempts() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    script.always(Err(timeout()));

    let err = gw.call("getSlot", json!([])).await.expect_err("exhausted");
    match err {
        GatewayError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(script.call_count(), 4);
}

#[tokio::test]
async fn refused_endpoint_fails_over_to_next() {
    let (gw, script) = gateway(&["http://a", "http://b"], ManualClock::shared(0));
    script.push(Err(RpcError::new(RpcErrorKind::Refused, "connection refused")));
    script.push(Ok(json!({"context": {"slot": 1}, "value": 5_000})));

    assert_eq!(gw.get_balance("acct").await.expect("balance"), 5_000);
    let calls = script.calls.lock().clone();
    assert_eq!(calls[0].0, "http://a");
    assert_eq!(calls[1].0, "http://b");
    assert_eq!(gw.health().failovers, 1);
    assert_eq!(gw.health().active_endpoint, "http://b");
}

#[tokio::test]
async fn breaker_fails_fast_then_recovers_through_probes() {
    let clock = ManualClock::shared(1_000);
    let (gw, script) = gateway(&["http://a"], clock.clone());
    script.push(Err(timeout()));
    script.push(Err(timeout()));
    script.push(Err(timeout()));
    script.push(Err(timeout()));
    // fifth consecutive failure trips the breaker mid-call
    script.push(Err(timeout()));
    let _ = gw.get_slot().await.expect_err("exhausted");
    let _ = gw.get_slot().await.expect_err("open");
    assert_eq!(script.call_count(), 5);
    assert_eq!(gw.circuit_state(), CircuitState::Open);

    clock.advance(Duration::from_secs(29));
    let err = gw.call("getSlot", json!([])).await.expect_err("still open");
    assert!(matches!(err, GatewayError::CircuitOpen { retry_in_ms } if retry_in_ms == 1_000));
    assert_eq!(script.call_count(), 5);

    clock.advance(Duration::from_secs(1));
    script.always(Ok(json!(10)));
    assert_eq!(gw.get_slot().await.expect("probe 1"), 10);
    assert_eq!(gw.circuit_state(), CircuitState::HalfOpen);
    assert_eq!(gw.get_slot().await.expect("probe 2"), 10);
    assert_eq!(gw.circuit_state(), CircuitState::Closed);
    assert_eq!(script.call_count(), 7);
}

#[tokio::test]
async fn signature_query_forwards_cursor() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    script.push(Ok(json!([{"signature": "s9", "slot": 9, "err": null, "blockTime": null}])));

    let sigs = gw
        .get_signatures_for_address("fees", Some("s8"), 50)
        .await
        .expect("sigs");
    assert_eq!(sigs[0].signature, "s9");
    let calls = script.calls.lock().clone();
    assert_eq!(calls[0].1, "getSignaturesForAddress");
    assert_eq!(calls[0].2[1]["until"], json!("s8"));
    assert_eq!(calls[0].2[1]["limit"], json!(50));
}

#[tokio::test]
async fn missing_asset_reads_as_none() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    script.push(Err(RpcError::rpc(-32000, "Asset Not Found")));
    assert!(gw.get_asset_metadata("x").await.expect("lookup").is_none());
}

#[tokio::test]
async fn asset_pages_stop_on_short_page() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    script.push(Ok(json!({"total": 1, "items": [{"id": "M1", "content": {"metadata": {"name": "One", "symbol": "ONE"}}}]})));
    let assets = gw.get_assets_by_authority("auth").await.expect("assets");
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].symbol, "ONE");
    assert_eq!(script.call_count(), 1);
}

#[tokio::test]
async fn invalid_payload_never_reaches_the_network() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    assert!(gw.simulate_transaction("%%%").await.is_err());
    assert!(gw.send_transaction("").await.is_err());
    assert_eq!(script.call_count(), 0);
}

#[tokio::test]
async fn confirmation_polls_until_confirmed() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    let blockhash = Blockhash {
        hash: "bh".into(),
        last_valid_block_height: 100,
    };
    script.push(Ok(json!({"context": {"slot": 1}, "value": [null]})));
    script.push(Ok(json!(90)));
    script.push(Ok(json!({"context": {"slot": 2}, "value": [{"err": null, "confirmationStatus": "confirmed"}]})));

    let outcome = gw.confirm_transaction("sig", &blockhash).await.expect("confirm");
    assert_eq!(outcome, Confirmation::Confirmed);
}

#[tokio::test]
async fn confirmation_expires_past_block_height() {
    let (gw, script) = gateway(&["http://a"], ManualClock::shared(0));
    let blockhash = Blockhash {
        hash: "bh".into(),
        last_valid_block_height: 100,
    };
    script.push(Ok(json!({"context": {"slot": 1}, "value": [null]})));
    script.push(Ok(json!(101)));

    let outcome = gw.confirm_transaction("sig", &blockhash).await.expect("confirm");
    assert_eq!(outcome, Confirmation::Expired);
}
