use chrono::{DateTime, Utc};
/// 统一的类型定义模块
/// 交易所无关的行情/订单/仓位数据结构，全部使用已量化的价格
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, crate::core::error::ExchangeError>;

/// 市场类型
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Spot,
    Futures,
}

/// 保证金模式(仅期货)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MarginMode::Cross => write!(f, "cross"),
            MarginMode::Isolated => write!(f, "isolated"),
        }
    }
}

// ============= 量化辅助函数 =============
//
// 量化只发生在这里和网格模块，其他组件收到的价格/数量都已经过量化。

/// 按小数位数量化价格
pub fn quantize_price(price: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (price * factor).round() / factor
}

/// 按精度量化数量
pub fn quantize_amount(amount: f64, precision: u32) -> f64 {
    let factor = 10_f64.powi(precision as i32);
    (amount * factor).round() / factor
}

// ============= 行情数据 =============

/// 行情快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub high: f64,
    pub low: f64,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// 订单簿
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub timestamp: DateTime<Utc>,
}

/// K线数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 公开成交记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

// ============= 订单相关 =============

/// 订单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 订单类型
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// 订单是否仍在交易所挂着
    pub fn is_live(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }
}

/// 订单请求
///
/// client_order_id 由调用方生成，重试时沿用同一个ID保证幂等。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub market_type: MarketType,
    pub client_order_id: String,
    #[serde(default)]
    pub time_in_force: Option<String>,
    #[serde(default)]
    pub reduce_only: Option<bool>,
    #[serde(default)]
    pub post_only: Option<bool>,
    #[serde(default)]
    pub params: Option<HashMap<String, String>>,
}

impl OrderRequest {
    pub fn limit(
        symbol: String,
        side: OrderSide,
        amount: f64,
        price: f64,
        market_type: MarketType,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            market_type,
            client_order_id,
            time_in_force: Some("GTC".to_string()),
            reduce_only: None,
            post_only: None,
            params: None,
        }
    }

    pub fn market(
        symbol: String,
        side: OrderSide,
        amount: f64,
        market_type: MarketType,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            market_type,
            client_order_id,
            time_in_force: Some("IOC".to_string()),
            reduce_only: None,
            post_only: None,
            params: None,
        }
    }
}

/// 订单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub filled: f64,
    pub remaining: f64,
    pub status: OrderStatus,
    pub market_type: MarketType,
    pub timestamp: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
}

// ============= 账户数据 =============

/// 账户余额
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

/// 持仓(交易所侧快照)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// 带符号净持仓，多头为正
    pub amount: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub timestamp: DateTime<Utc>,
}

/// 用户成交(来自用户数据流或成交历史)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

// ============= 流事件 =============

/// 订阅通道
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subscription {
    Ticker(String),
    OrderBook(String),
    Trades(String),
    UserData,
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Subscription::Ticker(s) => write!(f, "ticker:{}", s),
            Subscription::OrderBook(s) => write!(f, "orderbook:{}", s),
            Subscription::Trades(s) => write!(f, "trades:{}", s),
            Subscription::UserData => write!(f, "user_data"),
        }
    }
}

/// 连接状态
///
/// Degraded 表示心跳丢失但订阅尚未确认失效；只有 Subscribed 状态下
/// 协调器才允许提交新订单。
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Subscribed,
    Degraded { missed_heartbeats: u32 },
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    /// 当前状态下推送的数据是否可信
    pub fn is_trusted(&self) -> bool {
        matches!(self, ConnectionState::Subscribed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Authenticated => write!(f, "Authenticated"),
            ConnectionState::Subscribed => write!(f, "Subscribed"),
            ConnectionState::Degraded { missed_heartbeats } => {
                write!(f, "Degraded(missed={})", missed_heartbeats)
            }
            ConnectionState::Reconnecting { attempt } => write!(f, "Reconnecting(#{})", attempt),
        }
    }
}

/// 推送给所有者队列的事件，按接收顺序投递
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Ticker(Ticker),
    OrderBook(OrderBook),
    Trade(Trade),
    Fill(Fill),
    OrderUpdate(Order),
    ConnectionChange(ConnectionState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_price() {
        assert_eq!(quantize_price(9500.004, 2), 9500.0);
        assert_eq!(quantize_price(9500.006, 2), 9500.01);
        assert_eq!(quantize_price(0.123456, 4), 0.1235);
        assert_eq!(quantize_price(100.0, 0), 100.0);
    }

    #[test]
    fn test_order_status_live() {
        assert!(OrderStatus::Open.is_live());
        assert!(OrderStatus::PartiallyFilled.is_live());
        assert!(!OrderStatus::Filled.is_live());
        assert!(!OrderStatus::Canceled.is_live());
        assert!(!OrderStatus::Rejected.is_live());
    }

    #[test]
    fn test_connection_state_trust() {
        assert!(ConnectionState::Subscribed.is_trusted());
        assert!(!ConnectionState::Authenticated.is_trusted());
        assert!(!ConnectionState::Degraded {
            missed_heartbeats: 3
        }
        .is_trusted());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_trusted());
    }
}
