use std::sync::Arc;

use crate::core::{
    config::ApiKeys,
    error::ExchangeError,
    exchange::ExchangeClient,
    types::{MarketType, Result},
};

pub mod binance;
pub mod okx;

pub use binance::BinanceExchange;
pub use okx::OkxExchange;

/// 按交易所标识创建客户端实例
///
/// 固定映射，配置里写什么交易所就构造什么实现，不依赖运行时反射。
pub fn create_exchange(
    exchange_id: &str,
    market_type: MarketType,
    api_keys: ApiKeys,
    requests_per_second: u32,
    testnet: bool,
) -> Result<Arc<dyn ExchangeClient>> {
    match exchange_id.to_lowercase().as_str() {
        "binance" => Ok(Arc::new(BinanceExchange::new(
            market_type,
            api_keys,
            requests_per_second,
            testnet,
        )?)),
        "okx" => Ok(Arc::new(OkxExchange::new(
            market_type,
            api_keys,
            requests_per_second,
        )?)),
        other => Err(ExchangeError::UnsupportedExchange(other.to_string())),
    }
}
