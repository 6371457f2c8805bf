//! 网格运行态数据结构
//!
//! 整个运行态由协调器独占，其他流程只通过事件队列和只读快照访问。

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::core::types::{ConnectionState, OrderSide, OrderStatus};

use super::ladder::Ladder;
use super::position::{PositionSnapshot, PositionTracker};

/// 协调器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Running,
    /// 风控动作执行中，常规补格暂停
    RiskOverride,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 格位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelState {
    /// 无挂单
    Empty,
    /// 订单已提交待确认
    Pending,
    /// 挂单在场
    Resting,
    /// 本周期提交被拒，下个tick重试
    Failed,
}

/// 梯子上的一个格位
#[derive(Debug, Clone)]
pub struct GridLevel {
    pub index: i64,
    pub price: f64,
    pub side: OrderSide,
    pub reduce_only: bool,
    pub amount: f64,
    pub state: LevelState,
    pub client_order_id: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// 本地订单镜像，按关联ID索引
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub index: i64,
    pub side: OrderSide,
    pub price: f64,
    pub amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// 风控动作，协调器是唯一执行者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskAction {
    NoOp,
    /// 撤掉梯子按新状态重挂
    CancelAndReplenish,
    /// 撤单并离场
    CancelAndExit,
    /// 暂停补格，不强制离场
    PauseReplenishment,
}

/// 风控事件记录
#[derive(Debug, Clone)]
pub struct RiskEventRecord {
    pub timestamp: DateTime<Utc>,
    pub controller: &'static str,
    pub action: RiskAction,
    pub reason: String,
}

/// 协调器独占的运行态
pub struct GridRuntimeState {
    pub run_state: RunState,
    pub ladder: Ladder,
    /// 启动/重算时现价所在格，马丁格尔放大的原点
    pub origin_index: i64,
    pub levels: HashMap<i64, GridLevel>,
    pub orders: HashMap<String, OrderRecord>,
    pub tracker: PositionTracker,
    pub connection: ConnectionState,
    pub current_price: f64,
    /// 资金保护或信任破坏期间暂停补格
    pub replenish_paused: bool,
    /// 对账信任破坏标志，连续干净快照后解除
    pub trust_breach: bool,
    /// 锁价触发后冻结有利侧扩张
    pub price_locked: bool,
    pub last_risk_event: Option<RiskEventRecord>,
    pub last_follow_recompute: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// 止损逃逸截止时间，超时未平仓升级为市价离场
    pub escape_deadline: Option<DateTime<Utc>>,
}

impl GridRuntimeState {
    pub fn new(ladder: Ladder) -> Self {
        Self {
            run_state: RunState::Initializing,
            origin_index: 0,
            ladder,
            levels: HashMap::new(),
            orders: HashMap::new(),
            tracker: PositionTracker::new(),
            connection: ConnectionState::Disconnected,
            current_price: 0.0,
            replenish_paused: false,
            trust_breach: false,
            price_locked: false,
            last_risk_event: None,
            last_follow_recompute: Utc::now(),
            started_at: None,
            escape_deadline: None,
        }
    }

    /// 是否允许提交新订单：必须 Running 且流连接可信
    pub fn can_submit_orders(&self) -> bool {
        self.run_state == RunState::Running && self.connection.is_trusted()
    }

    /// 找到某个关联ID对应的格位索引
    pub fn level_of_client_id(&self, client_order_id: &str) -> Option<i64> {
        self.orders.get(client_order_id).map(|o| o.index)
    }

    /// 仍在场上的挂单数
    pub fn live_order_count(&self) -> usize {
        self.orders.values().filter(|o| o.status.is_live()).count()
    }

    pub fn record_risk_event(&mut self, event: RiskEventRecord) {
        log::warn!(
            "🛡️ 风控触发 [{}] {:?}: {}",
            event.controller,
            event.action,
            event.reason
        );
        self.last_risk_event = Some(event);
    }
}

/// 只读状态快照，UI按自己的节奏轮询，核心从不等待消费方
#[derive(Debug, Clone)]
pub struct GridStatusSnapshot {
    pub run_state: RunState,
    pub connection: ConnectionState,
    pub current_price: f64,
    pub position: PositionSnapshot,
    pub ladder_lower: f64,
    pub ladder_upper: f64,
    pub live_orders: usize,
    pub replenish_paused: bool,
    pub last_risk_event: Option<RiskEventRecord>,
    pub updated_at: DateTime<Utc>,
}

impl GridRuntimeState {
    pub fn status_snapshot(&self) -> GridStatusSnapshot {
        GridStatusSnapshot {
            run_state: self.run_state,
            connection: self.connection.clone(),
            current_price: self.current_price,
            position: self.tracker.snapshot(),
            ladder_lower: self.ladder.lower_price(),
            ladder_upper: self.ladder.upper_price(),
            live_orders: self.live_order_count(),
            replenish_paused: self.replenish_paused,
            last_risk_event: self.last_risk_event.clone(),
            updated_at: Utc::now(),
        }
    }
}
