use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{RpcError, RpcErrorKind};

/// One JSON-RPC round trip against a specific endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| RpcError::new(RpcErrorKind::Other, format!("build http client: {e}")))?;
        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RpcError::from_status(status.as_u16(), &text));
        }

        let mut envelope = resp
            .json::<Value>()
            .await
            .map_err(|e| RpcError::from_reqwest(&e))?;
        unwrap_envelope(&mut envelope)
    }
}

/// Pull `result` out of a JSON-RPC response, mapping an `error` object.
pub fn unwrap_envelope(envelope: &mut Value) -> Result<Value, RpcError> {
    if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown rpc error");
        return Err(RpcError::rpc(code, message));
    }
    match envelope.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::decode("response has neither result nor error")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_result_and_error() {
        let mut ok = json!({"jsonrpc": "2.0", "id": 1, "result": 42});
        assert_eq!(unwrap_envelope(&mut ok).expect("result"), json!(42));

        let mut null_result = json!({"jsonrpc": "2.0", "id": 1, "result": null});
        assert_eq!(unwrap_envelope(&mut null_result).expect("null"), Value::Null);

        let mut err = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "Invalid params"}});
        let err = unwrap_envelope(&mut err).expect_err("error");
        assert_eq!(err.code, Some(-32602));
        assert_eq!(err.kind, RpcErrorKind::Rpc);

        let mut empty = json!({"jsonrpc": "2.0", "id": 1});
        assert_eq!(
            unwrap_envelope(&mut empty).expect_err("decode").kind,
            RpcErrorKind::Decode
        );
    }
}
