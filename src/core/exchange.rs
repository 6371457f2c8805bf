use crate::core::types::{
    Balance, Fill, Kline, MarginMode, Order, OrderBook, OrderRequest, Position, Result,
    StreamEvent, Subscription, Ticker, Trade,
};
use async_trait::async_trait;

/// 交易所统一能力接口
///
/// 每个交易所一个实现，由 exchanges::create_exchange 工厂按配置选择。
/// 错误在本层完成分类：瞬时网络错误、认证错误、订单拒绝、限流，
/// 上层只按分类处理，从不感知交易所差异。
///
/// 所有REST调用都经过实现内部的共享限流器；下单/撤单等变更类调用
/// 必须在提交前先以关联ID记录日志，进程中途崩溃后可人工恢复。
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// 交易所标识
    fn name(&self) -> &str;

    // === 连接生命周期（幂等） ===

    /// 建立REST会话并校验可达性
    async fn connect(&self) -> Result<()>;

    /// 校验API密钥有效性，失败返回 AuthError
    async fn authenticate(&self) -> Result<()>;

    /// 断开并释放资源
    async fn disconnect(&self) -> Result<()>;

    // === 行情快照（REST） ===

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_order_book(&self, symbol: &str, limit: Option<u32>) -> Result<OrderBook>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: Option<u32>)
        -> Result<Vec<Kline>>;

    async fn get_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Trade>>;

    // === 账户状态（REST） ===

    async fn get_balances(&self) -> Result<Vec<Balance>>;

    /// 获取指定交易对的净持仓，无持仓返回 None
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>>;

    async fn get_order_history(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Order>>;

    /// 最近的用户成交，用于对账时判定本地丢单是成交还是撤销
    async fn get_recent_fills(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Fill>>;

    // === 订单操作（变更类，重试下按关联ID幂等） ===

    async fn create_order(&self, request: OrderRequest) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<Order>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<Order>>;

    // === 一次性初始化（失败即中止启动） ===

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()>;

    // === 流式订阅原语（由 StreamSupervisor 驱动） ===

    /// 流连接地址；needs_auth 为真时返回私有流地址
    /// (Binance 会在这里创建 listenKey 并拼进URL)
    async fn stream_endpoint(&self, needs_auth: bool) -> Result<String>;

    /// 登录消息，公共流或基于URL鉴权的交易所返回 None
    fn auth_message(&self) -> Result<Option<String>>;

    /// 为一组订阅构建订阅消息
    fn build_subscribe_messages(&self, subscriptions: &[Subscription]) -> Result<Vec<String>>;

    /// 应用层心跳消息
    fn heartbeat_message(&self) -> String;

    /// 判断一条文本消息是否是心跳应答
    fn is_heartbeat_reply(&self, message: &str) -> bool;

    /// 判断一条文本消息是否是订阅确认，resubscribe 时用来计数
    fn is_subscribe_ack(&self, message: &str) -> bool;

    /// 解析推送消息；非业务消息（确认/心跳）返回空集合，
    /// 一条订单推送可能同时产生 OrderUpdate 和 Fill 两个事件
    fn parse_stream_message(&self, message: &str) -> Result<Vec<StreamEvent>>;

    // === 存活探测 ===

    /// 轻量级连通性探测，与业务级对账无关
    async fn health_check(&self) -> Result<()>;
}
