//! 协调器后台任务
//!
//! 三条控制流共享同一份运行态：事件队列消费、固定节奏tick、
//! 周期对账。所有订单提交集中在这里，风控与对账只产出决定。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::core::error::ExchangeError;
use crate::core::exchange::ExchangeClient;
use crate::core::types::{OrderRequest, OrderSide, OrderStatus, StreamEvent};
use crate::strategies::grid::application::health::{
    Correction, HealthReconciler, LocalBelief, ReconcileReport,
};
use crate::strategies::grid::application::risk::{
    RiskContext, RiskEngine, SCALP_CLOSE_FRACTION,
};
use crate::strategies::grid::domain::config::GridConfig;
use crate::strategies::grid::domain::ladder::{plan_levels, Ladder, LevelPlan};
use crate::strategies::grid::domain::state::{
    GridLevel, GridRuntimeState, LevelState, OrderRecord, RiskAction, RiskEventRecord, RunState,
};
use crate::utils::generate_order_id_with_tag;

/// 任务共享的依赖集合
#[derive(Clone)]
pub struct GridTaskContext {
    pub config: Arc<GridConfig>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub state: Arc<Mutex<GridRuntimeState>>,
    pub risk_engine: Arc<Mutex<RiskEngine>>,
    pub reconciler: Arc<Mutex<HealthReconciler>>,
    pub running: Arc<RwLock<bool>>,
}

fn side_tag(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "B",
        OrderSide::Sell => "S",
    }
}

/// 运行中出现致命错误（认证失效等）时强制进入停机
///
/// 返回是否已触发停机。非致命错误由调用方按瞬时错误处理。
async fn escalate_if_fatal(ctx: &GridTaskContext, error: &ExchangeError) -> bool {
    if !error.is_fatal() {
        return false;
    }

    log::error!("❌ [grid] 运行中出现致命错误，强制停机: {}", error);
    {
        let mut state = ctx.state.lock().await;
        state.run_state = RunState::ShuttingDown;
    }
    *ctx.running.write().await = false;
    true
}

// ============= 事件循环 =============

pub fn spawn_event_loop(
    ctx: GridTaskContext,
    mut events: mpsc::Receiver<StreamEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !*ctx.running.read().await {
                break;
            }
            match event {
                StreamEvent::Ticker(ticker) => {
                    {
                        let mut state = ctx.state.lock().await;
                        state.current_price = ticker.last;
                        state.tracker.mark_price(ticker.last);
                    }
                    maybe_recompute_follow(&ctx).await;
                    if let Err(e) = maintain_ladder(&ctx).await {
                        log::warn!("[grid] 梯子维护失败: {}", e);
                    }
                }
                StreamEvent::Trade(trade) => {
                    let mut state = ctx.state.lock().await;
                    state.current_price = trade.price;
                    state.tracker.mark_price(trade.price);
                }
                StreamEvent::OrderBook(_) => {}
                StreamEvent::Fill(fill) => {
                    let mut state = ctx.state.lock().await;
                    state.tracker.apply_fill(&fill);
                }
                StreamEvent::OrderUpdate(order) => {
                    handle_order_update(&ctx, order).await;
                }
                StreamEvent::ConnectionChange(connection) => {
                    let mut state = ctx.state.lock().await;
                    if !connection.is_trusted() && state.connection.is_trusted() {
                        log::warn!(
                            "[grid] 流连接退化为 {}，安全相关状态回退到REST轮询",
                            connection
                        );
                    }
                    state.connection = connection;
                }
            }
        }
    })
}

async fn handle_order_update(ctx: &GridTaskContext, order: crate::core::types::Order) {
    let mut state = ctx.state.lock().await;
    let client_id = match order.client_order_id.clone() {
        Some(id) => id,
        None => return,
    };

    let index = match state.orders.get_mut(&client_id) {
        Some(record) => {
            record.exchange_order_id = Some(order.id.clone());
            record.status = order.status;
            record.last_update = order.last_update.unwrap_or_else(Utc::now);
            record.index
        }
        None => return, // 非本策略订单
    };

    if !order.status.is_live() {
        if let Some(level) = state.levels.get_mut(&index) {
            if level.client_order_id.as_deref() == Some(client_id.as_str()) {
                level.client_order_id = None;
                level.state = if order.status == OrderStatus::Rejected {
                    level.failed_at = Some(Utc::now());
                    LevelState::Failed
                } else {
                    LevelState::Empty
                };
            }
        }
    }
}

// ============= 梯子维护 =============

/// 按当前价把梯子补齐：缺单的格位提交、出梯子的撤销
///
/// OrderRejected 只把对应格位标记为 Failed 本周期跳过，下个tick重试，
/// 不向上传播。连接不可信或处于风控接管时整体跳过。
pub async fn maintain_ladder(ctx: &GridTaskContext) -> Result<()> {
    let (to_submit, to_cancel) = {
        let mut state = ctx.state.lock().await;
        if !state.can_submit_orders() || state.current_price <= 0.0 {
            return Ok(());
        }

        let plans = plan_levels(
            &ctx.config.grid,
            &state.ladder,
            state.current_price,
            state.origin_index,
        );
        let plan_map: HashMap<i64, &LevelPlan> = plans.iter().map(|p| (p.index, p)).collect();

        // 出梯子或方向不符的在场挂单需要撤销
        let mut to_cancel: Vec<(String, String, i64)> = Vec::new();
        for record in state.orders.values() {
            if !record.status.is_live() {
                continue;
            }
            let keep = plan_map
                .get(&record.index)
                .map(|plan| plan.side == record.side)
                .unwrap_or(false);
            if !keep {
                if let Some(exchange_id) = &record.exchange_order_id {
                    to_cancel.push((
                        record.client_order_id.clone(),
                        exchange_id.clone(),
                        record.index,
                    ));
                }
            }
        }
        let canceling: HashSet<i64> = to_cancel.iter().map(|(_, _, index)| *index).collect();

        let lock_threshold = ctx.config.risk.price_lock.threshold;
        let is_long = ctx.config.grid.mode.is_long();

        let mut to_submit = Vec::new();
        for plan in &plans {
            if canceling.contains(&plan.index) {
                continue; // 先等撤单落地，下个周期再补
            }

            match state.levels.get(&plan.index) {
                Some(level)
                    if matches!(level.state, LevelState::Resting | LevelState::Pending)
                        && level.side == plan.side =>
                {
                    continue
                }
                // 本周期被拒过的格位跳过，tick开始时重置为Empty
                Some(level) if level.state == LevelState::Failed => continue,
                _ => {}
            }

            // 补格暂停期间只允许减仓侧挂单
            if state.replenish_paused && !plan.reduce_only {
                continue;
            }

            // 锁价后冻结有利侧扩张
            if state.price_locked {
                let beyond = if is_long {
                    plan.price > lock_threshold
                } else {
                    plan.price < lock_threshold
                };
                if beyond {
                    continue;
                }
            }

            // 瞬时失败的格位沿用上次的关联ID，重试在交易所侧保持幂等
            let client_id = state
                .levels
                .get(&plan.index)
                .and_then(|level| level.client_order_id.clone())
                .unwrap_or_else(|| {
                    generate_order_id_with_tag("grid", ctx.exchange.name(), side_tag(plan.side))
                });
            state.levels.insert(
                plan.index,
                GridLevel {
                    index: plan.index,
                    price: plan.price,
                    side: plan.side,
                    reduce_only: plan.reduce_only,
                    amount: plan.amount,
                    state: LevelState::Pending,
                    client_order_id: Some(client_id.clone()),
                    failed_at: None,
                },
            );
            to_submit.push((plan.clone(), client_id));
        }

        (to_submit, to_cancel)
    };

    for (client_id, exchange_id, index) in to_cancel {
        match ctx
            .exchange
            .cancel_order(&exchange_id, &ctx.config.symbol)
            .await
        {
            Ok(_) | Err(ExchangeError::OrderNotFound { .. }) => {
                let mut state = ctx.state.lock().await;
                if let Some(record) = state.orders.get_mut(&client_id) {
                    record.status = OrderStatus::Canceled;
                }
                if let Some(level) = state.levels.get_mut(&index) {
                    level.state = LevelState::Empty;
                    level.client_order_id = None;
                }
            }
            Err(e) => log::warn!("[grid] 撤销订单 {} 失败: {}", exchange_id, e),
        }
    }

    for (plan, client_id) in to_submit {
        let mut request = OrderRequest::limit(
            ctx.config.symbol.clone(),
            plan.side,
            plan.amount,
            plan.price,
            ctx.config.exchange.market_type,
            client_id.clone(),
        );
        if plan.reduce_only {
            request.reduce_only = Some(true);
        }

        match ctx.exchange.create_order(request).await {
            Ok(order) => {
                let mut state = ctx.state.lock().await;
                state.orders.insert(
                    client_id.clone(),
                    OrderRecord {
                        client_order_id: client_id.clone(),
                        exchange_order_id: Some(order.id),
                        index: plan.index,
                        side: plan.side,
                        price: plan.price,
                        amount: plan.amount,
                        status: order.status,
                        created_at: Utc::now(),
                        last_update: Utc::now(),
                    },
                );
                if let Some(level) = state.levels.get_mut(&plan.index) {
                    level.state = LevelState::Resting;
                }
            }
            Err(ExchangeError::OrderRejected {
                client_order_id,
                reason,
            }) => {
                // 交易所侧校验失败：标记格位，本周期跳过，下个tick重试
                log::warn!(
                    "[grid] 格位 {} 订单被拒 ({}): {}",
                    plan.index,
                    client_order_id,
                    reason
                );
                let mut state = ctx.state.lock().await;
                if let Some(level) = state.levels.get_mut(&plan.index) {
                    level.state = LevelState::Failed;
                    level.failed_at = Some(Utc::now());
                    level.client_order_id = None;
                }
            }
            Err(e) => {
                if escalate_if_fatal(ctx, &e).await {
                    return Ok(());
                }
                // 瞬时错误保留关联ID，下个周期用同一个ID重试
                log::warn!("[grid] 格位 {} 提交失败: {}", plan.index, e);
                let mut state = ctx.state.lock().await;
                if let Some(level) = state.levels.get_mut(&plan.index) {
                    level.state = LevelState::Empty;
                }
            }
        }
    }

    Ok(())
}

/// 跟随模式的边界重算：定时或价格越界触发，重算幂等
pub async fn maybe_recompute_follow(ctx: &GridTaskContext) {
    let grid = &ctx.config.grid;
    if !grid.mode.is_follow() {
        return;
    }
    let follow = match &grid.follow {
        Some(follow) => follow,
        None => return,
    };

    let rebuild = {
        let mut state = ctx.state.lock().await;
        if state.run_state != RunState::Running || state.current_price <= 0.0 {
            return;
        }

        let elapsed = Utc::now()
            .signed_duration_since(state.last_follow_recompute)
            .num_seconds();
        let timeout_due = elapsed >= follow.recompute_timeout_secs as i64;
        let edge_due = state
            .ladder
            .needs_follow_recompute(state.current_price, follow.follow_distance);
        if !timeout_due && !edge_due {
            return;
        }

        let new_ladder = Ladder::from_follow(
            grid.mode,
            state.current_price,
            follow,
            grid.interval,
            grid.price_decimals,
        );
        state.last_follow_recompute = Utc::now();
        if new_ladder == state.ladder {
            return; // 同一参考价重算结果不变
        }

        // 锁价后不允许向有利方向扩边界
        if state.price_locked {
            let extends_favorable = if grid.mode.is_long() {
                new_ladder.upper_price() > state.ladder.upper_price()
            } else {
                new_ladder.lower_price() < state.ladder.lower_price()
            };
            if extends_favorable {
                log::info!("[grid] 锁价生效，跳过有利侧边界扩张");
                return;
            }
        }

        log::info!(
            "[grid] 跟随边界重算: [{:.4}, {:.4}] -> [{:.4}, {:.4}]",
            state.ladder.lower_price(),
            state.ladder.upper_price(),
            new_ladder.lower_price(),
            new_ladder.upper_price()
        );
        state.origin_index = new_ladder.index_at(state.current_price);
        state.ladder = new_ladder;
        state.levels.clear();
        true
    };

    if rebuild {
        if let Err(e) = ctx.exchange.cancel_all_orders(&ctx.config.symbol).await {
            log::warn!("[grid] 重算前撤单失败: {}", e);
        }
        {
            let mut state = ctx.state.lock().await;
            for record in state.orders.values_mut() {
                if record.status.is_live() {
                    record.status = OrderStatus::Canceled;
                }
            }
        }
        if let Err(e) = maintain_ladder(ctx).await {
            log::warn!("[grid] 重算后补格失败: {}", e);
        }
    }
}

// ============= tick循环 =============

pub fn spawn_tick_loop(ctx: GridTaskContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(ctx.config.execution.tick_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if !*ctx.running.read().await {
                break;
            }
            run_tick(&ctx).await;
        }
    })
}

/// 单次tick：失败格位重新就绪、降级回退、逃逸升级、风控评估、补格
pub async fn run_tick(ctx: &GridTaskContext) {
    // 上周期被拒的格位恢复就绪
    {
        let mut state = ctx.state.lock().await;
        for level in state.levels.values_mut() {
            if level.state == LevelState::Failed {
                level.state = LevelState::Empty;
            }
        }
    }

    // 流连接不可信时安全相关状态回退到REST
    let degraded = {
        let state = ctx.state.lock().await;
        state.run_state == RunState::Running && !state.connection.is_trusted()
    };
    if degraded {
        match ctx.exchange.get_ticker(&ctx.config.symbol).await {
            Ok(ticker) => {
                let mut state = ctx.state.lock().await;
                state.current_price = ticker.last;
                state.tracker.mark_price(ticker.last);
            }
            Err(e) => log::warn!("[grid] REST行情回退失败: {}", e),
        }

        // 仓位属于安全相关状态，降级期间同样走REST
        match ctx.exchange.get_position(&ctx.config.symbol).await {
            Ok(position) => {
                let mut state = ctx.state.lock().await;
                let watermark = state.tracker.fill_seq();
                let (net, entry) = position
                    .map(|p| (p.amount, p.entry_price))
                    .unwrap_or((0.0, 0.0));
                if (state.tracker.net_quantity() - net).abs()
                    > ctx.config.health.position_tolerance
                {
                    state.tracker.apply_correction(
                        &crate::strategies::grid::domain::position::PositionCorrection {
                            net_quantity: net,
                            avg_entry_price: entry,
                            fill_watermark: watermark,
                        },
                    );
                }
            }
            Err(e) => log::warn!("[grid] REST仓位回退失败: {}", e),
        }
    }

    check_escape(ctx).await;

    // 风控评估：固定优先级，每tick至多一个动作
    let risk_ctx = {
        let state = ctx.state.lock().await;
        if state.run_state != RunState::Running || state.current_price <= 0.0 {
            None
        } else {
            Some(RiskContext {
                position: state.tracker.snapshot(),
                last_price: state.current_price,
                grid_interval: ctx.config.grid.interval,
            })
        }
    };
    if let Some(risk_ctx) = risk_ctx {
        let event = ctx.risk_engine.lock().await.evaluate(&risk_ctx);
        if let Some(event) = event {
            apply_risk_action(ctx, event).await;
        }
    }

    // 资金保护解除后自动恢复补格（信任破坏仍然挂起时除外）
    {
        let protection_active = ctx.risk_engine.lock().await.protection_active();
        let mut state = ctx.state.lock().await;
        state.replenish_paused = protection_active || state.trust_breach;
    }

    maybe_recompute_follow(ctx).await;
    if let Err(e) = maintain_ladder(ctx).await {
        log::warn!("[grid] tick补格失败: {}", e);
    }
}

/// 止损逃逸超时升级为市价离场
async fn check_escape(ctx: &GridTaskContext) {
    let due = {
        let state = ctx.state.lock().await;
        state
            .escape_deadline
            .map(|deadline| Utc::now() >= deadline)
            .unwrap_or(false)
    };
    if !due {
        return;
    }

    let net = {
        let state = ctx.state.lock().await;
        state.tracker.snapshot().net_quantity
    };

    if net.abs() > f64::EPSILON {
        log::error!(
            "❌ [grid] 止损逃逸超时仍有 {:.8} 仓位，升级市价离场",
            net
        );
        if let Err(e) = ctx.exchange.cancel_all_orders(&ctx.config.symbol).await {
            log::warn!("[grid] 逃逸升级撤单失败: {}", e);
        }
        submit_exit_order(ctx, true, 1.0).await;
    }

    let mut state = ctx.state.lock().await;
    state.escape_deadline = None;
    if state.run_state == RunState::RiskOverride {
        state.run_state = RunState::Running;
    }
}

/// 提交离场订单；market 为真时直接市价，否则以当前价限价逃逸
async fn submit_exit_order(ctx: &GridTaskContext, market: bool, fraction: f64) {
    let (net, price) = {
        let state = ctx.state.lock().await;
        let snapshot = state.tracker.snapshot();
        (snapshot.net_quantity, state.current_price)
    };
    if net.abs() <= f64::EPSILON {
        return;
    }

    let amount = crate::core::types::quantize_amount(
        net.abs() * fraction,
        ctx.config.grid.amount_precision,
    );
    if amount <= 0.0 {
        return;
    }
    let side = if net > 0.0 {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };
    let client_id = generate_order_id_with_tag("grid", ctx.exchange.name(), "X");

    let mut request = if market {
        OrderRequest::market(
            ctx.config.symbol.clone(),
            side,
            amount,
            ctx.config.exchange.market_type,
            client_id,
        )
    } else {
        OrderRequest::limit(
            ctx.config.symbol.clone(),
            side,
            amount,
            price,
            ctx.config.exchange.market_type,
            client_id,
        )
    };
    request.reduce_only = Some(true);

    if let Err(e) = ctx.exchange.create_order(request).await {
        log::error!("[grid] 离场订单提交失败: {}", e);
    }
}

/// 执行风控动作，协调器是唯一执行者
pub async fn apply_risk_action(ctx: &GridTaskContext, event: RiskEventRecord) {
    let action = event.action;
    let controller = event.controller;
    {
        let mut state = ctx.state.lock().await;
        state.record_risk_event(event);
    }

    match action {
        RiskAction::NoOp => {}
        RiskAction::PauseReplenishment => {
            let mut state = ctx.state.lock().await;
            state.replenish_paused = true;
        }
        RiskAction::CancelAndReplenish => {
            {
                let mut state = ctx.state.lock().await;
                state.run_state = RunState::RiskOverride;
                if controller == "price_lock" {
                    state.price_locked = true;
                }
            }

            if let Err(e) = ctx.exchange.cancel_all_orders(&ctx.config.symbol).await {
                log::warn!("[grid] 风控撤单失败: {}", e);
            }
            if controller == "scalping" {
                // 部分止盈后按新状态重挂
                submit_exit_order(ctx, true, SCALP_CLOSE_FRACTION).await;
            }

            let mut state = ctx.state.lock().await;
            for record in state.orders.values_mut() {
                if record.status.is_live() {
                    record.status = OrderStatus::Canceled;
                }
            }
            state.levels.clear();
            state.run_state = RunState::Running;
        }
        RiskAction::CancelAndExit => {
            {
                let mut state = ctx.state.lock().await;
                state.run_state = RunState::RiskOverride;
            }

            if let Err(e) = ctx.exchange.cancel_all_orders(&ctx.config.symbol).await {
                log::warn!("[grid] 风控撤单失败: {}", e);
            }

            if controller == "stop_loss" {
                // 逃逸序列：先限价离场，窗口内不成交升级市价
                submit_exit_order(ctx, false, 1.0).await;
                let mut state = ctx.state.lock().await;
                state.escape_deadline = Some(
                    Utc::now()
                        + chrono::Duration::seconds(
                            ctx.config.risk.stop_loss.escape_timeout_secs as i64,
                        ),
                );
                state.levels.clear();
                for record in state.orders.values_mut() {
                    if record.status.is_live() {
                        record.status = OrderStatus::Canceled;
                    }
                }
                // RiskOverride 保持到逃逸结束
            } else {
                // 止盈：直接市价全平
                submit_exit_order(ctx, true, 1.0).await;
                let mut state = ctx.state.lock().await;
                state.levels.clear();
                for record in state.orders.values_mut() {
                    if record.status.is_live() {
                        record.status = OrderStatus::Canceled;
                    }
                }
                state.run_state = RunState::Running;
            }
        }
    }
}

// ============= 对账循环 =============

pub fn spawn_health_loop(ctx: GridTaskContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(ctx.config.health.check_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if !*ctx.running.read().await {
                break;
            }
            run_health_cycle(&ctx).await;
        }
    })
}

pub async fn run_health_cycle(ctx: &GridTaskContext) {
    let belief = {
        let state = ctx.state.lock().await;
        if state.run_state == RunState::ShuttingDown || state.run_state == RunState::Stopped {
            return;
        }
        LocalBelief {
            live_orders: state
                .orders
                .values()
                .filter(|o| o.status.is_live())
                .cloned()
                .collect(),
            net_quantity: state.tracker.net_quantity(),
            fill_watermark: state.tracker.fill_seq(),
        }
    };

    let report = {
        let mut reconciler = ctx.reconciler.lock().await;
        reconciler
            .run_once(&ctx.exchange, &ctx.config.symbol, belief)
            .await
    };

    match report {
        Ok(report) => apply_reconcile_report(ctx, report).await,
        Err(e) => {
            if !escalate_if_fatal(ctx, &e).await {
                // 对账本身的瞬时失败留给下一个周期
                log::warn!("[grid] 对账周期失败: {}", e);
            }
        }
    }
}

/// 把对账结论写回运行态，所有修正都有日志
pub async fn apply_reconcile_report(ctx: &GridTaskContext, report: ReconcileReport) {
    let mut state = ctx.state.lock().await;

    for correction in report.corrections {
        match correction {
            Correction::AdoptOrder(order) => {
                let price = order.price.unwrap_or(state.current_price);
                let index = state.ladder.index_at(price);
                let client_id = order
                    .client_order_id
                    .clone()
                    .unwrap_or_else(|| order.id.clone());
                state.orders.insert(
                    client_id.clone(),
                    OrderRecord {
                        client_order_id: client_id.clone(),
                        exchange_order_id: Some(order.id.clone()),
                        index,
                        side: order.side,
                        price,
                        amount: order.amount,
                        status: order.status,
                        created_at: order.timestamp,
                        last_update: Utc::now(),
                    },
                );
                state.levels.insert(
                    index,
                    GridLevel {
                        index,
                        price,
                        side: order.side,
                        reduce_only: false,
                        amount: order.amount,
                        state: LevelState::Resting,
                        client_order_id: Some(client_id),
                        failed_at: None,
                    },
                );
            }
            Correction::MarkOrderGone {
                client_order_id,
                filled,
            } => {
                if let Some(record) = state.orders.get_mut(&client_order_id) {
                    record.status = if filled {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Canceled
                    };
                    record.last_update = Utc::now();
                    let index = record.index;
                    if let Some(level) = state.levels.get_mut(&index) {
                        if level.client_order_id.as_deref() == Some(client_order_id.as_str()) {
                            level.client_order_id = None;
                            level.state = LevelState::Empty;
                        }
                    }
                }
            }
            Correction::Position(correction) => {
                state.tracker.apply_correction(&correction);
            }
        }
    }

    if report.trust_breach {
        state.trust_breach = true;
        state.replenish_paused = true;
        state.record_risk_event(RiskEventRecord {
            timestamp: Utc::now(),
            controller: "health_check",
            action: RiskAction::PauseReplenishment,
            reason: "对账确认仓位偏差，暂停补格等待恢复".to_string(),
        });
    }
    if report.trust_restored {
        state.trust_breach = false;
        log::info!("[grid] 信任恢复，补格允许在下个tick恢复");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ConnectionState;
    use crate::strategies::grid::domain::config::{sample_config, GridConfig};
    use crate::strategies::grid::domain::position::PositionCorrection;
    use crate::testkit::MockExchange;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn make_ctx(mock: Arc<MockExchange>, config: GridConfig) -> GridTaskContext {
        let ladder = Ladder::from_fixed_range(
            config.grid.lower_price.unwrap(),
            config.grid.upper_price.unwrap(),
            config.grid.interval,
            config.grid.price_decimals,
        );
        let mut state = GridRuntimeState::new(ladder);
        state.run_state = RunState::Running;
        state.connection = ConnectionState::Subscribed;
        state.current_price = 9500.0;
        state.origin_index = state.ladder.index_at(9500.0);

        GridTaskContext {
            reconciler: Arc::new(Mutex::new(HealthReconciler::new(config.health.clone()))),
            risk_engine: Arc::new(Mutex::new(RiskEngine::new(config.risk.clone()))),
            config: Arc::new(config),
            exchange: mock,
            state: Arc::new(Mutex::new(state)),
            running: Arc::new(RwLock::new(true)),
        }
    }

    #[tokio::test]
    async fn test_maintain_ladder_populates_all_levels() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let ctx = make_ctx(mock.clone(), sample_config());

        maintain_ladder(&ctx).await.unwrap();

        // 11格扣掉现价所在格 = 10笔挂单
        assert_eq!(mock.submitted_count(), 10);
        let state = ctx.state.lock().await;
        assert_eq!(state.live_order_count(), 10);
        let submitted = mock.submitted.lock().unwrap();
        assert!(submitted
            .iter()
            .all(|r| r.price.unwrap() != 9500.0));
    }

    /// OrderRejected → 格位标记失败、不传播，下个tick重试同一格位
    #[tokio::test]
    async fn test_order_rejected_marks_level_and_retries_next_tick() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        mock.reject_next.store(1, AtomicOrdering::SeqCst);
        let ctx = make_ctx(mock.clone(), sample_config());

        maintain_ladder(&ctx).await.unwrap();
        assert_eq!(mock.submitted_count(), 9);

        let failed_index = {
            let state = ctx.state.lock().await;
            let failed: Vec<i64> = state
                .levels
                .values()
                .filter(|l| l.state == LevelState::Failed)
                .map(|l| l.index)
                .collect();
            assert_eq!(failed.len(), 1);
            failed[0]
        };

        // 同一周期内不重试
        maintain_ladder(&ctx).await.unwrap();
        assert_eq!(mock.submitted_count(), 9);

        // 下个tick重试同一格位
        run_tick(&ctx).await;
        assert_eq!(mock.submitted_count(), 10);
        let state = ctx.state.lock().await;
        assert_eq!(state.levels[&failed_index].state, LevelState::Resting);
    }

    /// 连接不可信时不提交任何新订单
    #[tokio::test]
    async fn test_degraded_connection_gates_submission() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let ctx = make_ctx(mock.clone(), sample_config());
        {
            let mut state = ctx.state.lock().await;
            state.connection = ConnectionState::Degraded {
                missed_heartbeats: 3,
            };
        }

        maintain_ladder(&ctx).await.unwrap();
        assert_eq!(mock.submitted_count(), 0);
    }

    /// 暂停补格时只允许减仓侧挂单
    #[tokio::test]
    async fn test_pause_replenishment_allows_exit_side_only() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let ctx = make_ctx(mock.clone(), sample_config());
        {
            let mut state = ctx.state.lock().await;
            state.replenish_paused = true;
        }

        maintain_ladder(&ctx).await.unwrap();

        let submitted = mock.submitted.lock().unwrap();
        assert!(!submitted.is_empty());
        assert!(submitted.iter().all(|r| r.reduce_only == Some(true)));
    }

    /// 止损动作：撤掉梯子、限价逃逸、超时升级市价
    #[tokio::test]
    async fn test_stop_loss_escape_then_market_escalation() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let ctx = make_ctx(mock.clone(), sample_config());
        {
            let mut state = ctx.state.lock().await;
            // 人为造出1个多头仓位
            state.tracker.apply_fill(&crate::core::types::Fill {
                id: "f1".to_string(),
                order_id: "1".to_string(),
                client_order_id: None,
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                price: 9500.0,
                amount: 0.5,
                fee: 0.0,
                timestamp: Utc::now(),
            });
            state.current_price = 9000.0;
        }

        apply_risk_action(
            &ctx,
            RiskEventRecord {
                timestamp: Utc::now(),
                controller: "stop_loss",
                action: RiskAction::CancelAndExit,
                reason: "测试".to_string(),
            },
        )
        .await;

        // 限价逃逸单已提交
        {
            let submitted = mock.submitted.lock().unwrap();
            assert_eq!(submitted.len(), 1);
            let exit = &submitted[0];
            assert_eq!(exit.side, OrderSide::Sell);
            assert_eq!(exit.reduce_only, Some(true));
            assert_eq!(exit.price, Some(9000.0));
        }
        assert_eq!(mock.cancel_all_calls.load(AtomicOrdering::SeqCst), 1);
        {
            let state = ctx.state.lock().await;
            assert_eq!(state.run_state, RunState::RiskOverride);
            assert!(state.escape_deadline.is_some());
        }

        // 把逃逸截止时间拨到过去，tick触发市价升级
        {
            let mut state = ctx.state.lock().await;
            state.escape_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        check_escape(&ctx).await;

        {
            let submitted = mock.submitted.lock().unwrap();
            assert_eq!(submitted.len(), 2);
            let escalation = &submitted[1];
            assert_eq!(
                escalation.order_type,
                crate::core::types::OrderType::Market
            );
            assert_eq!(escalation.reduce_only, Some(true));
        }
        let state = ctx.state.lock().await;
        assert_eq!(state.run_state, RunState::Running);
        assert!(state.escape_deadline.is_none());
    }

    /// 对账结论应用：收编、标记消失、信任破坏暂停补格
    #[tokio::test]
    async fn test_apply_reconcile_report() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let ctx = make_ctx(mock.clone(), sample_config());

        // 预置一个本地在场订单
        {
            let mut state = ctx.state.lock().await;
            state.orders.insert(
                "GRDB1".to_string(),
                OrderRecord {
                    client_order_id: "GRDB1".to_string(),
                    exchange_order_id: Some("7".to_string()),
                    index: 4,
                    side: OrderSide::Buy,
                    price: 9400.0,
                    amount: 0.01,
                    status: OrderStatus::Open,
                    created_at: Utc::now(),
                    last_update: Utc::now(),
                },
            );
        }

        let adopted = crate::core::types::Order {
            id: "900".to_string(),
            client_order_id: Some("EXT1".to_string()),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: crate::core::types::OrderType::Limit,
            amount: 0.01,
            price: Some(9600.0),
            filled: 0.0,
            remaining: 0.01,
            status: OrderStatus::Open,
            market_type: crate::core::types::MarketType::Futures,
            timestamp: Utc::now(),
            last_update: None,
        };

        let report = ReconcileReport {
            corrections: vec![
                Correction::AdoptOrder(adopted),
                Correction::MarkOrderGone {
                    client_order_id: "GRDB1".to_string(),
                    filled: true,
                },
                Correction::Position(PositionCorrection {
                    net_quantity: 0.25,
                    avg_entry_price: 9450.0,
                    fill_watermark: 0,
                }),
            ],
            trust_breach: true,
            trust_restored: false,
        };

        apply_reconcile_report(&ctx, report).await;

        let state = ctx.state.lock().await;
        assert!(state.orders.contains_key("EXT1"));
        assert_eq!(state.orders["GRDB1"].status, OrderStatus::Filled);
        assert_eq!(state.tracker.net_quantity(), 0.25);
        assert!(state.trust_breach);
        assert!(state.replenish_paused);
        assert_eq!(
            state.last_risk_event.as_ref().unwrap().controller,
            "health_check"
        );
    }

    /// 跟随模式边界重算后全量撤单重挂
    #[tokio::test]
    async fn test_follow_recompute_rebuilds_ladder() {
        let mut config = sample_config();
        config.grid.mode = crate::strategies::grid::domain::config::GridMode::FollowLong;
        config.grid.lower_price = None;
        config.grid.upper_price = None;
        config.grid.follow = Some(crate::strategies::grid::domain::config::FollowSection {
            grid_count: 10,
            follow_distance: 200.0,
            recompute_timeout_secs: 3600,
            price_offset_grids: 2,
        });

        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let ladder = Ladder::from_follow(
            config.grid.mode,
            9500.0,
            config.grid.follow.as_ref().unwrap(),
            config.grid.interval,
            config.grid.price_decimals,
        );
        let mut state = GridRuntimeState::new(ladder);
        state.run_state = RunState::Running;
        state.connection = ConnectionState::Subscribed;
        state.current_price = 9500.0;
        state.origin_index = state.ladder.index_at(9500.0);

        let ctx = GridTaskContext {
            reconciler: Arc::new(Mutex::new(HealthReconciler::new(config.health.clone()))),
            risk_engine: Arc::new(Mutex::new(RiskEngine::new(config.risk.clone()))),
            config: Arc::new(config),
            exchange: mock.clone(),
            state: Arc::new(Mutex::new(state)),
            running: Arc::new(RwLock::new(true)),
        };

        let old_upper = { ctx.state.lock().await.ladder.upper_price() };

        // 价格大幅越过上边界+follow_distance
        {
            let mut state = ctx.state.lock().await;
            state.current_price = old_upper + 500.0;
        }
        maybe_recompute_follow(&ctx).await;

        assert_eq!(mock.cancel_all_calls.load(AtomicOrdering::SeqCst), 1);
        let state = ctx.state.lock().await;
        assert!(state.ladder.upper_price() > old_upper);
        // 新梯子已重新挂满
        assert!(state.live_order_count() > 0);
    }
}
