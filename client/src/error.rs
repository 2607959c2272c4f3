use std::time::Duration;

use ethers::providers::{ProviderError, RpcError as _};

/// Metric label for an error category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Request exceeded the configured budget.
    Timeout,
    /// DNS, TCP, or TLS level failure.
    Connection,
    /// Well-formed JSON-RPC error response.
    Rpc,
    /// Decoding, ABI, or format error.
    Value,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Lowercase label used on `rpc_call_errors_total`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Rpc => "rpc",
            Self::Value => "value",
            Self::Unknown => "unknown",
        }
    }
}

/// An RPC-side failure, categorised at the transport boundary so callers
/// can branch without string-matching.
#[derive(Clone, Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    #[error("value error: {0}")]
    Value(String),

    #[error("unknown rpc failure: {0}")]
    Unknown(String),
}

impl Error {
    /// The metric category this error maps to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Connection(_) => ErrorCategory::Connection,
            Self::Rpc { .. } => ErrorCategory::Rpc,
            Self::Value(_) => ErrorCategory::Value,
            Self::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Range-too-wide responses are deterministic and excluded; the log
    /// chunker reacts to them by splitting the range instead.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::Unknown(_) => true,
            Self::Value(_) => false,
            Self::Rpc { code, message } => {
                if self.is_range_too_wide() {
                    return false;
                }
                let message = message.to_lowercase();
                match *code {
                    // Method-not-found, invalid params, execution revert.
                    -32601 | -32602 | 3 => false,
                    _ if message.contains("revert") => false,
                    // Rate limiting in its common spellings.
                    -32005 => true,
                    _ if message.contains("rate") || message.contains("429") => true,
                    _ => true,
                }
            }
        }
    }

    /// Whether this is a provider refusing a log query for covering too
    /// large a block range or result set.
    pub fn is_range_too_wide(&self) -> bool {
        let Self::Rpc { code, message } = self else {
            return false;
        };

        if *code == -32005 {
            return true;
        }

        let message = message.to_lowercase();
        ["block range", "range is too", "too big", "too large", "too many results", "exceeded max", "query returned more than"]
            .iter()
            .any(|needle| message.contains(needle))
    }

    /// Categorise an [`ethers`] provider error at the boundary.
    pub fn from_provider(error: ProviderError, timeout: Duration) -> Self {
        match error {
            ProviderError::JsonRpcClientError(inner) => {
                if let Some(response) = inner.as_error_response() {
                    return Self::Rpc {
                        code: response.code,
                        message: response.message.clone(),
                    };
                }
                if let Some(serde_error) = inner.as_serde_error() {
                    return Self::Value(serde_error.to_string());
                }

                let text = inner.to_string();
                let lower = text.to_lowercase();
                if lower.contains("timed out") || lower.contains("timeout") {
                    Self::Timeout(timeout)
                } else if lower.contains("connect")
                    || lower.contains("dns")
                    || lower.contains("refused")
                    || lower.contains("reset")
                    || lower.contains("broken pipe")
                {
                    Self::Connection(text)
                } else {
                    Self::Unknown(text)
                }
            }
            ProviderError::HTTPError(error) => {
                if error.is_timeout() {
                    Self::Timeout(timeout)
                } else {
                    Self::Connection(error.to_string())
                }
            }
            ProviderError::SerdeJson(error) => Self::Value(error.to_string()),
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// The crate result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i64, message: &str) -> Error {
        Error::Rpc {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn categories_map_to_labels() {
        assert_eq!(
            Error::Timeout(Duration::from_secs(10)).category().as_str(),
            "timeout"
        );
        assert_eq!(
            Error::Connection("refused".into()).category().as_str(),
            "connection"
        );
        assert_eq!(rpc(-32000, "boom").category().as_str(), "rpc");
        assert_eq!(Error::Value("bad abi".into()).category().as_str(), "value");
        assert_eq!(Error::Unknown("?".into()).category().as_str(), "unknown");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(Error::Connection("reset".into()).is_transient());
        assert!(Error::Unknown("?".into()).is_transient());
        assert!(!Error::Value("bad".into()).is_transient());

        assert!(rpc(-32000, "rate limit exceeded, retry in 1s").is_transient());
        assert!(!rpc(-32601, "method not found").is_transient());
        assert!(!rpc(-32602, "invalid params").is_transient());
        assert!(!rpc(3, "execution reverted").is_transient());
        assert!(!rpc(-32000, "execution reverted: ERC20: zero address").is_transient());
    }

    #[test]
    fn range_too_wide_detection() {
        assert!(rpc(-32005, "query exceeds limits").is_range_too_wide());
        assert!(rpc(-32000, "block range is too wide").is_range_too_wide());
        assert!(rpc(-32602, "Log response size exceeded max limit").is_range_too_wide());
        assert!(rpc(-32000, "query returned more than 10000 results").is_range_too_wide());
        assert!(!rpc(-32000, "header not found").is_range_too_wide());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_range_too_wide());
    }
}
