// 核心模块 - 交易所无关的数据模型与连接基础设施
pub mod config;
pub mod error;
pub mod exchange;
pub mod rate_limit;
pub mod retry;
pub mod types;
pub mod websocket;

pub use config::ApiKeys;
pub use error::{ErrorSeverity, ExchangeError};
pub use exchange::ExchangeClient;
pub use rate_limit::RateLimiter;
pub use retry::{retry_async, ExponentialBackoffRetry, RetryConfig};
pub use types::{
    Balance, ConnectionState, Fill, Kline, MarginMode, MarketType, Order, OrderBook, OrderRequest,
    OrderSide, OrderStatus, OrderType, Position, Result, StreamEvent, Subscription, Ticker, Trade,
};
pub use websocket::{StreamConfig, StreamSupervisor, StreamTransport, WsTransport};
