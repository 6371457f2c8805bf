use crate::core::error::ExchangeError;

/// API密钥配置
#[derive(Debug, Clone)]
pub struct ApiKeys {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl ApiKeys {
    /// 从环境变量加载API密钥
    ///
    /// 变量名按交易所前缀约定：BINANCE_API_KEY / BINANCE_API_SECRET，
    /// OKX 另需 OKX_PASSPHRASE。
    pub fn from_env(exchange: &str) -> Result<Self, ExchangeError> {
        dotenv::dotenv().ok(); // 加载.env文件，忽略错误

        let exchange_upper = exchange.to_uppercase();

        let api_key = std::env::var(format!("{}_API_KEY", exchange_upper)).map_err(|_| {
            ExchangeError::ConfigError(format!("未找到{}的API_KEY环境变量", exchange))
        })?;

        // 兼容两种格式的密钥变量名
        let api_secret = std::env::var(format!("{}_API_SECRET", exchange_upper))
            .or_else(|_| std::env::var(format!("{}_SECRET_KEY", exchange_upper)))
            .map_err(|_| {
                ExchangeError::ConfigError(format!(
                    "未找到{}的API_SECRET或SECRET_KEY环境变量",
                    exchange
                ))
            })?;

        let passphrase = std::env::var(format!("{}_PASSPHRASE", exchange_upper))
            .or_else(|_| std::env::var(format!("{}_API_PASSWORD", exchange_upper)))
            .ok();

        Ok(ApiKeys {
            api_key,
            api_secret,
            passphrase,
        })
    }

    /// 测试/模拟环境下的空密钥
    pub fn anonymous() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: None,
        }
    }
}
