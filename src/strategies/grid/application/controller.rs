//! 网格协调器
//!
//! 顶层控制循环：Initializing → Running → {RiskOverride} → Running
//! → ShuttingDown → Stopped。订单提交只发生在协调器拥有的任务里，
//! 风控与对账以事件和结论的方式参与。

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::core::exchange::ExchangeClient;
use crate::core::retry::retry_async;
use crate::core::types::{MarketType, Subscription};
use crate::core::websocket::{StreamConfig, StreamSupervisor, TransportFactory};
use crate::strategies::common::application::{deps::StrategyDeps, strategy::{Strategy, StrategyInstance}};
use crate::strategies::grid::application::health::HealthReconciler;
use crate::strategies::grid::application::risk::RiskEngine;
use crate::strategies::grid::application::tasks::{self, GridTaskContext};
use crate::strategies::grid::domain::config::GridConfig;
use crate::strategies::grid::domain::ladder::Ladder;
use crate::strategies::grid::domain::position::PositionCorrection;
use crate::strategies::grid::domain::state::{GridRuntimeState, GridStatusSnapshot, RunState};

pub struct GridCoordinator {
    ctx: GridTaskContext,
    transport_factory: TransportFactory,
    handles: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
}

impl GridCoordinator {
    fn build_ladder(config: &GridConfig, reference_price: f64) -> Ladder {
        let grid = &config.grid;
        if grid.mode.is_follow() {
            Ladder::from_follow(
                grid.mode,
                reference_price,
                grid.follow.as_ref().expect("validate保证跟随配置存在"),
                grid.interval,
                grid.price_decimals,
            )
        } else {
            Ladder::from_fixed_range(
                grid.lower_price.expect("validate保证区间存在"),
                grid.upper_price.expect("validate保证区间存在"),
                grid.interval,
                grid.price_decimals,
            )
        }
    }

    fn stream_config(config: &GridConfig) -> StreamConfig {
        StreamConfig {
            heartbeat_interval_secs: config.stream.heartbeat_interval_secs,
            heartbeat_miss_limit: config.stream.heartbeat_miss_limit,
            reconnect_initial_delay_ms: config.stream.reconnect_initial_delay_ms,
            reconnect_max_delay_ms: config.stream.reconnect_max_delay_ms,
            subscribe_timeout_secs: config.stream.subscribe_timeout_secs,
        }
    }

    /// 初始化序列：连接 → 认证 → 一次性设置 → 初始梯子 → 启动任务
    async fn initialize(&self) -> Result<()> {
        let config = &self.ctx.config;
        let exchange = &self.ctx.exchange;

        // 连接类瞬时错误带退避重试，认证失败是致命错误直接中止
        retry_async(|| exchange.connect(), 3)
            .await
            .context("交易所连接失败")?;
        exchange
            .authenticate()
            .await
            .context("交易所认证失败，中止启动")?;

        // 一次性设置失败即中止启动
        if config.exchange.market_type == MarketType::Futures {
            exchange
                .set_leverage(&config.symbol, config.grid.leverage)
                .await
                .context("设置杠杆失败")?;
            exchange
                .set_margin_mode(&config.symbol, config.grid.margin_mode)
                .await
                .context("设置保证金模式失败")?;
        }

        if config.execution.startup_cancel_all {
            if let Err(e) = exchange.cancel_all_orders(&config.symbol).await {
                log::warn!("[grid] 启动时清理挂单失败: {}", e);
            }
        }

        let ticker = retry_async(|| exchange.get_ticker(&config.symbol), 3)
            .await
            .context("获取初始行情失败")?;
        if ticker.last <= 0.0 {
            anyhow::bail!("初始行情价格非法: {}", ticker.last);
        }

        // 本地快照只是建议性缓存，从一轮新的交易所状态重建
        let initial_position = exchange.get_position(&config.symbol).await?;

        {
            let mut state = self.ctx.state.lock().await;
            state.current_price = ticker.last;
            state.tracker.mark_price(ticker.last);
            state.ladder = Self::build_ladder(config, ticker.last);
            state.origin_index = state.ladder.index_at(ticker.last);
            state.last_follow_recompute = Utc::now();

            if let Some(position) = initial_position {
                log::info!(
                    "[grid] 启动时收编交易所仓位: {:.8} @ {:.4}",
                    position.amount,
                    position.entry_price
                );
                state.tracker.apply_correction(&PositionCorrection {
                    net_quantity: position.amount,
                    avg_entry_price: position.entry_price,
                    fill_watermark: 0,
                });
            }

            state.run_state = RunState::Running;
            state.started_at = Some(Utc::now());
            log::info!(
                "[grid] 初始化完成: {} 梯子 [{:.4}, {:.4}] 现价 {:.4}",
                config.symbol,
                state.ladder.lower_price(),
                state.ladder.upper_price(),
                ticker.last
            );
        }

        Ok(())
    }

    /// 只读状态快照，UI按自己的节奏轮询
    pub async fn status(&self) -> GridStatusSnapshot {
        self.ctx.state.lock().await.status_snapshot()
    }

    /// 有界重试的停机步骤，失败记录后继续下一步
    async fn shutdown_step<F, Fut>(&self, name: &str, step: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = crate::core::types::Result<()>>,
    {
        let limit = self.ctx.config.execution.shutdown_retry_limit.max(1);
        for attempt in 1..=limit {
            match step().await {
                Ok(()) => {
                    log::info!("✅ [grid] 停机步骤完成: {}", name);
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "[grid] 停机步骤 {} 第{}/{}次失败: {}",
                        name,
                        attempt,
                        limit,
                        e
                    );
                }
            }
        }
        // 卡死的停机比不完整的停机更糟，继续走下一步
        log::error!("❌ [grid] 停机步骤 {} 放弃重试，继续后续步骤", name);
    }
}

impl Strategy for GridCoordinator {
    type Config = GridConfig;

    fn create(config: Self::Config, deps: StrategyDeps) -> Result<Self> {
        // 配置只校验一次，精度错误在这里拒绝启动
        config.validate()?;

        let placeholder = Self::build_ladder(&config, 1.0);
        let ctx = GridTaskContext {
            risk_engine: Arc::new(Mutex::new(RiskEngine::new(config.risk.clone()))),
            reconciler: Arc::new(Mutex::new(HealthReconciler::new(config.health.clone()))),
            state: Arc::new(Mutex::new(GridRuntimeState::new(placeholder))),
            config: Arc::new(config),
            exchange: deps.exchange,
            running: Arc::new(RwLock::new(false)),
        };

        Ok(Self {
            ctx,
            transport_factory: deps.transport_factory,
            handles: Arc::new(RwLock::new(Vec::new())),
        })
    }
}

#[async_trait::async_trait]
impl StrategyInstance for GridCoordinator {
    async fn start(&self) -> Result<()> {
        self.initialize().await?;
        *self.ctx.running.write().await = true;

        let (events_tx, events_rx) = mpsc::channel(1024);
        let subscriptions = vec![
            Subscription::Ticker(self.ctx.config.symbol.clone()),
            Subscription::UserData,
        ];
        let supervisor = StreamSupervisor::new(
            self.ctx.exchange.clone(),
            subscriptions,
            Self::stream_config(&self.ctx.config),
            events_tx,
            self.ctx.running.clone(),
        );

        let mut handles = self.handles.write().await;
        handles.clear();
        handles.push(supervisor.spawn(self.transport_factory.clone()));
        handles.push(tasks::spawn_event_loop(self.ctx.clone(), events_rx));
        handles.push(tasks::spawn_tick_loop(self.ctx.clone()));
        handles.push(tasks::spawn_health_loop(self.ctx.clone()));

        log::info!("[grid] 协调器已启动");
        Ok(())
    }

    /// 有序停机：停止接单 → 撤销挂单 → 可选平仓 → 断开连接
    ///
    /// 每一步有界重试、尽力而为，失败只记录不阻塞后续步骤。
    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.ctx.state.lock().await;
            state.run_state = RunState::ShuttingDown;
        }
        *self.ctx.running.write().await = false;

        let symbol = self.ctx.config.symbol.clone();

        if self.ctx.config.execution.shutdown_cancel_all {
            let exchange = self.ctx.exchange.clone();
            let cancel_symbol = symbol.clone();
            self.shutdown_step("撤销全部挂单", move || {
                let exchange = exchange.clone();
                let symbol = cancel_symbol.clone();
                async move { exchange.cancel_all_orders(&symbol).await.map(|_| ()) }
            })
            .await;
        }

        if self.ctx.config.execution.close_position_on_exit {
            let exchange = self.ctx.exchange.clone();
            let close_symbol = symbol.clone();
            let market_type = self.ctx.config.exchange.market_type;
            let precision = self.ctx.config.grid.amount_precision;
            let exchange_name = self.ctx.exchange.name().to_string();
            self.shutdown_step("平掉剩余仓位", move || {
                let exchange = exchange.clone();
                let symbol = close_symbol.clone();
                let exchange_name = exchange_name.clone();
                async move {
                    let position = exchange.get_position(&symbol).await?;
                    let net = position.map(|p| p.amount).unwrap_or(0.0);
                    if net.abs() <= f64::EPSILON {
                        return Ok(());
                    }
                    let side = if net > 0.0 {
                        crate::core::types::OrderSide::Sell
                    } else {
                        crate::core::types::OrderSide::Buy
                    };
                    let amount = crate::core::types::quantize_amount(net.abs(), precision);
                    let mut request = crate::core::types::OrderRequest::market(
                        symbol,
                        side,
                        amount,
                        market_type,
                        crate::utils::generate_order_id_with_tag("grid", &exchange_name, "Z"),
                    );
                    request.reduce_only = Some(true);
                    exchange.create_order(request).await.map(|_| ())
                }
            })
            .await;
        }

        {
            let exchange = self.ctx.exchange.clone();
            self.shutdown_step("断开交易所连接", move || {
                let exchange = exchange.clone();
                async move { exchange.disconnect().await }
            })
            .await;
        }

        let mut handles = self.handles.write().await;
        for handle in handles.iter() {
            handle.abort();
        }
        while let Some(handle) = handles.pop() {
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    log::debug!("[grid] 后台任务已中断: {:?}", e);
                } else {
                    log::warn!("[grid] 任务结束时出现错误: {:?}", e);
                }
            }
        }

        // 终态快照落日志，支持人工恢复
        let mut state = self.ctx.state.lock().await;
        state.run_state = RunState::Stopped;
        let snapshot = state.status_snapshot();
        let live: Vec<&String> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_live())
            .map(|(id, _)| id)
            .collect();
        log::info!(
            "🔚 [grid] 已停止。终态: 净仓 {:.8} 均价 {:.4} 已实现盈亏 {:.4} 在场订单 {:?}",
            snapshot.position.net_quantity,
            snapshot.position.avg_entry_price,
            snapshot.position.realized_pnl,
            live
        );

        Ok(())
    }
}
