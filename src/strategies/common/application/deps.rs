use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::core::exchange::ExchangeClient;
use crate::core::websocket::{TransportFactory, WsTransport};

/// 统一的策略依赖容器，由运行时环境在启动时构建后传入
///
/// 进程里没有任何可变全局状态，策略需要的一切都从这里拿。
#[derive(Clone)]
pub struct StrategyDeps {
    pub exchange: Arc<dyn ExchangeClient>,
    /// 流传输工厂，测试时注入脚本化实现
    pub transport_factory: TransportFactory,
}

impl StrategyDeps {
    pub fn builder() -> StrategyDepsBuilder {
        StrategyDepsBuilder::default()
    }
}

/// 构建策略依赖的辅助结构
#[derive(Default)]
pub struct StrategyDepsBuilder {
    exchange: Option<Arc<dyn ExchangeClient>>,
    transport_factory: Option<TransportFactory>,
}

impl StrategyDepsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange(mut self, exchange: Arc<dyn ExchangeClient>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<StrategyDeps> {
        Ok(StrategyDeps {
            exchange: self
                .exchange
                .ok_or_else(|| anyhow!("StrategyDeps 缺少 exchange"))?,
            transport_factory: self
                .transport_factory
                .unwrap_or_else(WsTransport::factory),
        })
    }
}
