use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("YAML配置错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("API错误: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("认证错误: {0}")]
    AuthError(String),

    #[error("订单被拒绝: {reason} (关联ID: {client_order_id})")]
    OrderRejected {
        client_order_id: String,
        reason: String,
    },

    #[error("订单未找到: ID {order_id} (交易对: {symbol})")]
    OrderNotFound { order_id: String, symbol: String },

    #[error("WebSocket错误: {0}")]
    WebSocketError(String),

    #[error("速率限制: {0}")]
    RateLimitError(String, Option<u64>),

    #[error("不支持的交易所: {0}")]
    UnsupportedExchange(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("精度配置错误: {field} - {reason}")]
    PrecisionError { field: String, reason: String },

    #[error("数据解析错误: {0}")]
    ParseError(String),

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_seconds}秒)")]
    TimeoutError {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("不支持的功能: {0}")]
    NotSupported(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl ExchangeError {
    /// 判断错误是否可以重试
    ///
    /// 网络类错误(超时/5xx/断线/限流)都属于瞬时错误，认证、配置、
    /// 订单拒绝等错误重试没有意义。
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::NetworkError(_) => true,
            ExchangeError::TimeoutError { .. } => true,
            ExchangeError::RateLimitError(_, _) => true,
            ExchangeError::WebSocketError(_) => true,
            ExchangeError::ApiError { code, .. } => {
                // HTTP 5xx 错误通常可以重试
                *code >= 500 && *code < 600
            }
            _ => false,
        }
    }

    /// 获取建议的重试等待时间(秒)
    ///
    /// 限流错误用更长的退避下限，避免重试本身继续消耗配额。
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimitError(_, retry_after) => Some(retry_after.unwrap_or(5)),
            ExchangeError::NetworkError(_) => Some(1),
            ExchangeError::WebSocketError(_) => Some(1),
            ExchangeError::TimeoutError { .. } => Some(2),
            ExchangeError::ApiError { code, .. } if *code >= 500 => Some(5),
            _ => None,
        }
    }

    /// 是否属于致命错误：发生后应终止启动或强制进入停机流程
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::AuthError(_)
                | ExchangeError::ConfigError(_)
                | ExchangeError::PrecisionError { .. }
                | ExchangeError::UnsupportedExchange(_)
        )
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExchangeError::NetworkError(_) => ErrorSeverity::Warning,
            ExchangeError::TimeoutError { .. } => ErrorSeverity::Warning,
            ExchangeError::RateLimitError(_, _) => ErrorSeverity::Warning,
            ExchangeError::WebSocketError(_) => ErrorSeverity::Warning,
            ExchangeError::OrderRejected { .. } => ErrorSeverity::Error,
            ExchangeError::AuthError(_) => ErrorSeverity::Critical,
            ExchangeError::ConfigError(_) => ErrorSeverity::Critical,
            ExchangeError::PrecisionError { .. } => ErrorSeverity::Critical,
            ExchangeError::UnsupportedExchange(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorSeverity {
    Info,     // 信息性错误，通常不影响操作
    Warning,  // 警告性错误，可以重试
    Error,    // 一般错误，需要跳过当前周期
    Critical, // 严重错误，需要停止运行
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let rejected = ExchangeError::OrderRejected {
            client_order_id: "GRD123".to_string(),
            reason: "margin insufficient".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_fatal());

        let rate_limited = ExchangeError::RateLimitError("too many requests".to_string(), None);
        assert!(rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after(), Some(5));

        let server_error = ExchangeError::ApiError {
            code: 503,
            message: "unavailable".to_string(),
        };
        assert!(server_error.is_retryable());

        let client_error = ExchangeError::ApiError {
            code: 400,
            message: "bad request".to_string(),
        };
        assert!(!client_error.is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ExchangeError::AuthError("bad key".to_string()).is_fatal());
        assert!(ExchangeError::PrecisionError {
            field: "price_decimals".to_string(),
            reason: "negative".to_string(),
        }
        .is_fatal());
        assert!(!ExchangeError::TimeoutError {
            operation: "get_ticker".to_string(),
            timeout_seconds: 10,
        }
        .is_fatal());
    }
}
