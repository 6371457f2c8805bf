//! 测试桩：可脚本化的交易所实现
//!
//! 供监督器/对账器/协调器的单元测试共用，REST状态通过内部互斥量
//! 注入和检视，不发任何真实网络请求。

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::core::{
    error::ExchangeError,
    exchange::ExchangeClient,
    types::{
        Balance, Fill, Kline, MarginMode, MarketType, Order, OrderBook, OrderRequest, OrderStatus,
        Position, Result, StreamEvent, Subscription, Ticker, Trade,
    },
    websocket::{StreamTransport, TransportFactory, TransportMessage},
};

pub struct MockExchange {
    symbol: String,
    pub submitted: Mutex<Vec<OrderRequest>>,
    pub canceled: Mutex<Vec<String>>,
    pub cancel_all_calls: AtomicU32,
    pub open_orders: Mutex<Vec<Order>>,
    pub position: Mutex<Option<Position>>,
    pub recent_fills: Mutex<Vec<Fill>>,
    pub reject_clients: Mutex<HashSet<String>>,
    /// 拒绝接下来的N次下单，模拟保证金不足
    pub reject_next: AtomicU32,
    pub ticker_price: Mutex<f64>,
    next_id: AtomicU64,
}

impl MockExchange {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            submitted: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            cancel_all_calls: AtomicU32::new(0),
            open_orders: Mutex::new(Vec::new()),
            position: Mutex::new(None),
            recent_fills: Mutex::new(Vec::new()),
            reject_clients: Mutex::new(HashSet::new()),
            reject_next: AtomicU32::new(0),
            ticker_price: Mutex::new(0.0),
            next_id: AtomicU64::new(1),
        }
    }

    /// 指定关联ID的订单将被交易所拒绝
    pub fn reject_client_id(&self, client_order_id: &str) {
        self.reject_clients
            .lock()
            .unwrap()
            .insert(client_order_id.to_string());
    }

    pub fn set_price(&self, price: f64) {
        *self.ticker_price.lock().unwrap() = price;
    }

    pub fn set_position(&self, amount: f64, entry_price: f64) {
        *self.position.lock().unwrap() = Some(Position {
            symbol: self.symbol.clone(),
            amount,
            entry_price,
            mark_price: entry_price,
            unrealized_pnl: 0.0,
            leverage: 1,
            timestamp: Utc::now(),
        });
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let last = *self.ticker_price.lock().unwrap();
        Ok(Ticker {
            symbol: symbol.to_string(),
            high: last,
            low: last,
            bid: last,
            ask: last,
            last,
            volume: 0.0,
            timestamp: Utc::now(),
        })
    }

    async fn get_order_book(&self, symbol: &str, _limit: Option<u32>) -> Result<OrderBook> {
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    async fn get_klines(
        &self,
        _symbol: &str,
        _interval: &str,
        _limit: Option<u32>,
    ) -> Result<Vec<Kline>> {
        Ok(Vec::new())
    }

    async fn get_trades(&self, _symbol: &str, _limit: Option<u32>) -> Result<Vec<Trade>> {
        Ok(Vec::new())
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        Ok(Vec::new())
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<Position>> {
        Ok(self.position.lock().unwrap().clone())
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<Order>> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn get_order_history(&self, _symbol: &str, _limit: Option<u32>) -> Result<Vec<Order>> {
        Ok(Vec::new())
    }

    async fn get_recent_fills(&self, _symbol: &str, _limit: Option<u32>) -> Result<Vec<Fill>> {
        Ok(self.recent_fills.lock().unwrap().clone())
    }

    async fn create_order(&self, request: OrderRequest) -> Result<Order> {
        if self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExchangeError::OrderRejected {
                client_order_id: request.client_order_id,
                reason: "insufficient margin".to_string(),
            });
        }
        if self
            .reject_clients
            .lock()
            .unwrap()
            .contains(&request.client_order_id)
        {
            return Err(ExchangeError::OrderRejected {
                client_order_id: request.client_order_id,
                reason: "insufficient margin".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order = Order {
            id: id.to_string(),
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: 0.0,
            remaining: request.amount,
            status: OrderStatus::Open,
            market_type: request.market_type,
            timestamp: Utc::now(),
            last_update: None,
        };

        self.open_orders.lock().unwrap().push(order.clone());
        self.submitted.lock().unwrap().push(request);
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        let mut orders = self.open_orders.lock().unwrap();
        let index = orders.iter().position(|o| o.id == order_id);
        match index {
            Some(index) => {
                let mut order = orders.remove(index);
                order.status = OrderStatus::Canceled;
                self.canceled.lock().unwrap().push(order_id.to_string());
                Ok(order)
            }
            None => Err(ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
            }),
        }
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<Vec<Order>> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.open_orders.lock().unwrap();
        let mut canceled: Vec<Order> = orders.drain(..).collect();
        for order in canceled.iter_mut() {
            order.status = OrderStatus::Canceled;
            self.canceled.lock().unwrap().push(order.id.clone());
        }
        Ok(canceled)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: MarginMode) -> Result<()> {
        Ok(())
    }

    async fn stream_endpoint(&self, needs_auth: bool) -> Result<String> {
        Ok(if needs_auth {
            "wss://mock/private".to_string()
        } else {
            "wss://mock/public".to_string()
        })
    }

    fn auth_message(&self) -> Result<Option<String>> {
        Ok(Some(r#"{"op":"login"}"#.to_string()))
    }

    fn build_subscribe_messages(&self, subscriptions: &[Subscription]) -> Result<Vec<String>> {
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }
        let channels = subscriptions
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(vec![format!(
            r#"{{"op":"subscribe","channels":"{}"}}"#,
            channels
        )])
    }

    fn heartbeat_message(&self) -> String {
        "ping".to_string()
    }

    fn is_heartbeat_reply(&self, message: &str) -> bool {
        message == "pong"
    }

    fn is_subscribe_ack(&self, message: &str) -> bool {
        message == "ack"
    }

    fn parse_stream_message(&self, _message: &str) -> Result<Vec<StreamEvent>> {
        Ok(Vec::new())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// 脚本化传输：send 遇到订阅消息自动回推确认，recv 从内部队列取
///
/// 不投喂消息时 recv 永久挂起，正好用来驱动心跳看门狗超时。
pub struct FakeTransport {
    tx: mpsc::UnboundedSender<TransportMessage>,
    rx: mpsc::UnboundedReceiver<TransportMessage>,
    log: Arc<Mutex<Vec<String>>>,
    connects: Arc<Mutex<u32>>,
}

impl FakeTransport {
    pub fn new(log: Arc<Mutex<Vec<String>>>, connects: Arc<Mutex<u32>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            log,
            connects,
        }
    }

    /// 生成共享记录的工厂，返回 (工厂, 发送日志, 建连计数)
    pub fn shared_factory() -> (TransportFactory, Arc<Mutex<Vec<String>>>, Arc<Mutex<u32>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(Mutex::new(0u32));
        let log_clone = log.clone();
        let connects_clone = connects.clone();
        let factory: TransportFactory = Arc::new(move || {
            Box::new(FakeTransport::new(log_clone.clone(), connects_clone.clone()))
                as Box<dyn StreamTransport>
        });
        (factory, log, connects)
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn connect(&mut self, _url: &str) -> Result<()> {
        *self.connects.lock().unwrap() += 1;
        Ok(())
    }

    async fn send(&mut self, message: String) -> Result<()> {
        self.log.lock().unwrap().push(message.clone());
        if message.contains("subscribe") {
            // 模拟交易所立即确认订阅
            let _ = self.tx.send(TransportMessage::Text("ack".to_string()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        match self.rx.recv().await {
            Some(message) => Ok(message),
            None => Ok(TransportMessage::Closed),
        }
    }

    async fn close(&mut self) {}
}
