/// 统一的WebSocket管理模块 - 心跳保活与断线重连
///
/// 每个交易所一条流连接，由 StreamSupervisor 负责：订阅注册、心跳
/// 存活判定、指数退避重连，重连成功后先补齐全部订阅再宣告 Subscribed。
/// 事件通过有界队列推给所有者，不做回调。
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::{
    error::ExchangeError,
    exchange::ExchangeClient,
    types::{ConnectionState, Result, StreamEvent, Subscription},
};

// ============= 传输层抽象 =============

/// 传输层消息
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Text(String),
    Ping(Vec<u8>),
    Closed,
}

/// 流式传输抽象，生产环境使用 WebSocket，测试注入脚本化实现
#[async_trait]
pub trait StreamTransport: Send {
    async fn connect(&mut self, url: &str) -> Result<()>;

    async fn send(&mut self, message: String) -> Result<()>;

    /// 读取下一条消息，无消息时挂起；超时由调用方控制
    async fn recv(&mut self) -> Result<TransportMessage>;

    async fn close(&mut self);
}

/// 创建传输实例的工厂，重连时每次新建
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn StreamTransport> + Send + Sync>;

/// 基于 tokio-tungstenite 的WebSocket传输
pub struct WsTransport {
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub fn factory() -> TransportFactory {
        Arc::new(|| Box::new(WsTransport::new()) as Box<dyn StreamTransport>)
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&mut self, url: &str) -> Result<()> {
        log::info!("🔌 正在连接WebSocket: {}", url);
        match connect_async(url).await {
            Ok((stream, _)) => {
                log::info!("✅ WebSocket连接成功");
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => Err(ExchangeError::WebSocketError(format!(
                "Connection failed: {}",
                e
            ))),
        }
    }

    async fn send(&mut self, message: String) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ExchangeError::WebSocketError("Not connected".to_string()))?;
        stream
            .send(Message::Text(message))
            .await
            .map_err(|e| ExchangeError::WebSocketError(format!("Send failed: {}", e)))
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ExchangeError::WebSocketError("Not connected".to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(TransportMessage::Text(text)),
                Some(Ok(Message::Ping(data))) => {
                    // 自动回复Pong，同时作为存活信号上报
                    let _ = stream.send(Message::Pong(data.clone())).await;
                    return Ok(TransportMessage::Ping(data));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(TransportMessage::Closed),
                Some(Ok(_)) => continue, // 其他帧类型忽略
                Some(Err(e)) => {
                    return Err(ExchangeError::WebSocketError(format!(
                        "Receive error: {}",
                        e
                    )))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
            log::info!("🔌 WebSocket连接已断开");
        }
    }
}

// ============= 流监督器 =============

/// 流连接配置
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 连续丢失多少次心跳进入 Degraded
    pub heartbeat_miss_limit: u32,
    /// 重连初始延迟（毫秒）
    pub reconnect_initial_delay_ms: u64,
    /// 重连最大延迟（毫秒）
    pub reconnect_max_delay_ms: u64,
    /// 等待订阅确认的超时（秒）
    pub subscribe_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 20,
            heartbeat_miss_limit: 3,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            subscribe_timeout_secs: 10,
        }
    }
}

/// 每个交易所一条流连接的监督器
///
/// 状态机: Disconnected → Connecting → Authenticated → Subscribed
///         → {Degraded → Reconnecting → Connecting} | Disconnected(停机)
pub struct StreamSupervisor {
    exchange: Arc<dyn ExchangeClient>,
    subscriptions: Vec<Subscription>,
    config: StreamConfig,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::Sender<StreamEvent>,
    running: Arc<RwLock<bool>>,
}

impl StreamSupervisor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        subscriptions: Vec<Subscription>,
        config: StreamConfig,
        events: mpsc::Sender<StreamEvent>,
        running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            exchange,
            subscriptions,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events,
            running,
        }
    }

    /// 共享连接状态，协调器用它决定是否允许下单
    pub fn state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        self.state.clone()
    }

    /// 启动监督循环，返回任务句柄
    pub fn spawn(self, factory: TransportFactory) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(factory).await;
        })
    }

    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut guard = self.state.write().await;
            if *guard == new_state {
                return;
            }
            log::info!(
                "[stream:{}] 连接状态 {} -> {}",
                self.exchange.name(),
                *guard,
                new_state
            );
            *guard = new_state.clone();
        }
        // 队列已关闭说明所有者退出，这里静默忽略
        let _ = self
            .events
            .send(StreamEvent::ConnectionChange(new_state))
            .await;
    }

    async fn run(self, factory: TransportFactory) {
        let mut attempt: u32 = 0;
        let needs_auth = self.subscriptions.contains(&Subscription::UserData);

        loop {
            if !*self.running.read().await {
                self.set_state(ConnectionState::Disconnected).await;
                return;
            }

            self.set_state(ConnectionState::Connecting).await;
            let mut transport = factory();

            match self.establish(transport.as_mut(), needs_auth).await {
                Ok(()) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Subscribed).await;
                }
                Err(e) => {
                    log::warn!(
                        "[stream:{}] 建连失败: {}，准备重连",
                        self.exchange.name(),
                        e
                    );
                    transport.close().await;
                    attempt += 1;
                    self.set_state(ConnectionState::Reconnecting { attempt }).await;
                    self.backoff(attempt).await;
                    continue;
                }
            }

            // 读取循环，返回时说明连接需要重建
            self.read_loop(transport.as_mut()).await;
            transport.close().await;

            if !*self.running.read().await {
                self.set_state(ConnectionState::Disconnected).await;
                return;
            }

            attempt += 1;
            self.set_state(ConnectionState::Reconnecting { attempt }).await;
            self.backoff(attempt).await;
        }
    }

    /// 建连 → 认证 → 补齐全部订阅
    ///
    /// 任何一步失败都整体失败，绝不在部分订阅成功的状态下宣告 Subscribed。
    async fn establish(
        &self,
        transport: &mut dyn StreamTransport,
        needs_auth: bool,
    ) -> Result<()> {
        let url = self.exchange.stream_endpoint(needs_auth).await?;
        transport.connect(&url).await?;

        if let Some(auth) = self.exchange.auth_message()? {
            transport.send(auth).await?;
        }
        self.set_state(ConnectionState::Authenticated).await;

        let messages = self.exchange.build_subscribe_messages(&self.subscriptions)?;
        let expected_acks = messages.len();
        for message in messages {
            transport.send(message).await?;
        }

        if expected_acks > 0 {
            self.wait_for_acks(transport, expected_acks).await?;
        }

        log::info!(
            "[stream:{}] 已补齐 {} 个订阅通道",
            self.exchange.name(),
            self.subscriptions.len()
        );
        Ok(())
    }

    /// 等待全部订阅确认，期间到达的业务事件正常转发
    async fn wait_for_acks(
        &self,
        transport: &mut dyn StreamTransport,
        expected: usize,
    ) -> Result<()> {
        let deadline = Duration::from_secs(self.config.subscribe_timeout_secs);
        let mut acked = 0usize;

        while acked < expected {
            let message = timeout(deadline, transport.recv())
                .await
                .map_err(|_| ExchangeError::TimeoutError {
                    operation: "subscribe_ack".to_string(),
                    timeout_seconds: self.config.subscribe_timeout_secs,
                })??;

            match message {
                TransportMessage::Text(text) => {
                    if self.exchange.is_subscribe_ack(&text) {
                        acked += 1;
                    } else if !self.exchange.is_heartbeat_reply(&text) {
                        self.forward_events(&text).await;
                    }
                }
                TransportMessage::Ping(_) => {}
                TransportMessage::Closed => {
                    return Err(ExchangeError::WebSocketError(
                        "等待订阅确认时连接关闭".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }

    /// 读取循环：心跳看门狗 + 事件转发
    async fn read_loop(&self, transport: &mut dyn StreamTransport) {
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs);
        let mut missed: u32 = 0;

        loop {
            if !*self.running.read().await {
                return;
            }

            match timeout(heartbeat, transport.recv()).await {
                Ok(Ok(TransportMessage::Text(text))) => {
                    missed = 0;
                    if self.exchange.is_heartbeat_reply(&text)
                        || self.exchange.is_subscribe_ack(&text)
                    {
                        continue;
                    }
                    self.forward_events(&text).await;
                }
                Ok(Ok(TransportMessage::Ping(_))) => {
                    // 传输层Ping即存活信号
                    missed = 0;
                }
                Ok(Ok(TransportMessage::Closed)) => {
                    log::warn!("[stream:{}] 连接被对端关闭", self.exchange.name());
                    return;
                }
                Ok(Err(e)) => {
                    log::warn!("[stream:{}] 接收错误: {}", self.exchange.name(), e);
                    return;
                }
                Err(_) => {
                    // 心跳窗口内没有任何消息
                    missed += 1;
                    log::debug!(
                        "💓 [stream:{}] 心跳缺失 {}/{}",
                        self.exchange.name(),
                        missed,
                        self.config.heartbeat_miss_limit
                    );

                    if missed >= self.config.heartbeat_miss_limit {
                        // 订阅疑似失效但尚未确认丢失，先降级再走重连
                        self.set_state(ConnectionState::Degraded {
                            missed_heartbeats: missed,
                        })
                        .await;
                        return;
                    }

                    if let Err(e) = transport.send(self.exchange.heartbeat_message()).await {
                        log::warn!("[stream:{}] 心跳发送失败: {}", self.exchange.name(), e);
                        return;
                    }
                }
            }
        }
    }

    async fn forward_events(&self, text: &str) {
        match self.exchange.parse_stream_message(text) {
            Ok(events) => {
                for event in events {
                    if self.events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("[stream:{}] 消息解析失败: {}", self.exchange.name(), e);
            }
        }
    }

    /// 指数退避 + 抖动，封顶等待
    async fn backoff(&self, attempt: u32) {
        let base = self.config.reconnect_initial_delay_ms as f64
            * 2_f64.powi(attempt.saturating_sub(1).min(16) as i32);
        let capped = base.min(self.config.reconnect_max_delay_ms as f64) as u64;
        let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
        let delay = Duration::from_millis(capped + jitter);

        log::info!(
            "🔄 [stream:{}] 第{}次重连，等待 {:.1}s",
            self.exchange.name(),
            attempt,
            delay.as_secs_f64()
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeTransport, MockExchange};

    fn fast_config() -> StreamConfig {
        StreamConfig {
            heartbeat_interval_secs: 1,
            heartbeat_miss_limit: 3,
            reconnect_initial_delay_ms: 1,
            reconnect_max_delay_ms: 4,
            subscribe_timeout_secs: 1,
        }
    }

    async fn drain_states(
        rx: &mut mpsc::Receiver<StreamEvent>,
        until: ConnectionState,
        max: usize,
    ) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        for _ in 0..max {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("等待状态超时")
                .expect("事件通道关闭");
            if let StreamEvent::ConnectionChange(state) = event {
                states.push(state.clone());
                if state == until {
                    break;
                }
            }
        }
        states
    }

    /// 心跳丢失3次 → Degraded → Reconnecting，重连后先补订阅再回 Subscribed
    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_miss_degrades_then_resubscribes() {
        let exchange = Arc::new(MockExchange::new("BTCUSDT"));
        let (factory, log, connects) = FakeTransport::shared_factory();
        let (tx, mut rx) = mpsc::channel(64);
        let running = Arc::new(RwLock::new(true));

        let supervisor = StreamSupervisor::new(
            exchange.clone(),
            vec![
                Subscription::Ticker("BTCUSDT".to_string()),
                Subscription::UserData,
            ],
            fast_config(),
            tx,
            running.clone(),
        );

        let handle = supervisor.spawn(factory);

        // 第一次建连
        let states = drain_states(&mut rx, ConnectionState::Subscribed, 10).await;
        assert!(states.contains(&ConnectionState::Connecting));
        assert!(states.contains(&ConnectionState::Authenticated));
        assert_eq!(states.last(), Some(&ConnectionState::Subscribed));

        // 之后不再有任何消息，心跳看门狗连续3次超时
        let states = drain_states(
            &mut rx,
            ConnectionState::Degraded {
                missed_heartbeats: 3,
            },
            10,
        )
        .await;
        assert_eq!(
            states.last(),
            Some(&ConnectionState::Degraded {
                missed_heartbeats: 3
            })
        );

        // 降级后走重连路径，重连完成回到 Subscribed
        let states = drain_states(&mut rx, ConnectionState::Subscribed, 10).await;
        assert!(states.contains(&ConnectionState::Reconnecting { attempt: 1 }));
        assert_eq!(states.last(), Some(&ConnectionState::Subscribed));

        // 两次建连各发了一轮订阅消息
        assert_eq!(*connects.lock().unwrap(), 2);
        let sent = log.lock().unwrap();
        let subscribe_count = sent.iter().filter(|m| m.contains("subscribe")).count();
        assert_eq!(subscribe_count, 2);

        *running.write().await = false;
        handle.abort();
    }

    /// 停机时不再重连
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reconnect() {
        let exchange = Arc::new(MockExchange::new("BTCUSDT"));
        let (factory, _log, _connects) = FakeTransport::shared_factory();
        let (tx, mut rx) = mpsc::channel(64);
        let running = Arc::new(RwLock::new(true));

        let supervisor = StreamSupervisor::new(
            exchange,
            vec![Subscription::Ticker("BTCUSDT".to_string())],
            fast_config(),
            tx,
            running.clone(),
        );

        let handle = supervisor.spawn(factory);

        drain_states(&mut rx, ConnectionState::Subscribed, 10).await;

        // 触发停机标志后，下一次循环应以 Disconnected 结束
        *running.write().await = false;
        let states = drain_states(&mut rx, ConnectionState::Disconnected, 12).await;
        assert_eq!(states.last(), Some(&ConnectionState::Disconnected));

        handle.await.unwrap();
    }
}
