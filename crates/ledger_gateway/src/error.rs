use core_types::is_transient_message;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    Refused,
    Timeout,
    RateLimited,
    Reset,
    /// 5xx or node-side "unavailable / behind" responses.
    Unavailable,
    /// JSON-RPC error object returned by the node.
    Rpc,
    Decode,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
    pub code: Option<i64>,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match code {
            // node is behind / slot skipped / long-term storage miss
            -32004 | -32005 | -32007 | -32014 => RpcErrorKind::Unavailable,
            429 | -32429 => RpcErrorKind::RateLimited,
            _ if message.to_ascii_lowercase().contains("rate limit") => RpcErrorKind::RateLimited,
            _ => RpcErrorKind::Rpc,
        };
        Self {
            kind,
            message,
            code: Some(code),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Decode, message)
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 => RpcErrorKind::RateLimited,
            500..=599 => RpcErrorKind::Unavailable,
            _ => RpcErrorKind::Other,
        };
        let snippet = body.chars().take(200).collect::<String>();
        Self {
            kind,
            message: format!("http {status}: {snippet}"),
            code: Some(status as i64),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let text = err.to_string();
        let kind = if err.is_timeout() {
            RpcErrorKind::Timeout
        } else if err.is_connect() {
            RpcErrorKind::Refused
        } else if text.to_ascii_lowercase().contains("reset") {
            RpcErrorKind::Reset
        } else if err.is_decode() {
            RpcErrorKind::Decode
        } else if err.is_request() || err.is_body() {
            RpcErrorKind::Reset
        } else {
            RpcErrorKind::Other
        };
        Self::new(kind, text)
    }

    pub fn is_transient(&self) -> bool {
        match self.kind {
            RpcErrorKind::Refused
            | RpcErrorKind::Timeout
            | RpcErrorKind::RateLimited
            | RpcErrorKind::Reset
            | RpcErrorKind::Unavailable => true,
            RpcErrorKind::Rpc | RpcErrorKind::Other => is_transient_message(&self.message),
            RpcErrorKind::Decode => false,
        }
    }

    /// Failures that say "this endpoint" rather than "this request".
    pub fn triggers_failover(&self) -> bool {
        matches!(
            self.kind,
            RpcErrorKind::Refused | RpcErrorKind::RateLimited | RpcErrorKind::Unavailable
        )
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("circuit open; next probe in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: i64 },
    #[error("{method} failed: {source}")]
    Permanent {
        method: String,
        #[source]
        source: RpcError,
    },
    #[error("{method} exhausted {attempts} attempts: {last}")]
    Exhausted {
        method: String,
        attempts: u32,
        last: RpcError,
    },
    #[error("gateway misconfigured: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::Exhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(RpcError::from_status(429, "").kind, RpcErrorKind::RateLimited);
        assert_eq!(RpcError::from_status(503, "busy").kind, RpcErrorKind::Unavailable);
        assert_eq!(RpcError::from_status(400, "bad").kind, RpcErrorKind::Other);
        assert!(!RpcError::from_status(400, "bad").is_transient());
    }

    #[test]
    fn rpc_codes_for_lagging_nodes_are_transient() {
        let err = RpcError::rpc(-32005, "Node is behind by 120 slots");
        assert!(err.is_transient());
        assert!(err.triggers_failover());
        let err = RpcError::rpc(-32602, "Invalid params");
        assert!(!err.is_transient());
    }

    #[test]
    fn circuit_open_message_reads_as_transient() {
        let err = GatewayError::CircuitOpen { retry_in_ms: 10 };
        assert!(core_types::is_transient_message(&err.to_string()));
    }
}
