//! 风控看门器
//!
//! 五个独立看门器按固定优先级逐tick评估：
//! 止损 > 资金保护 > 止盈 > 锁价 > 剥头皮，
//! 每tick最多一个动作生效，先命中者赢。动作只上报给协调器执行，
//! 看门器自身从不下单，保证订单提交始终单线程走协调器。

use chrono::Utc;

use crate::strategies::grid::domain::config::RiskSection;
use crate::strategies::grid::domain::position::PositionSnapshot;
use crate::strategies::grid::domain::state::{RiskAction, RiskEventRecord};

/// 每tick送入风控的只读上下文
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub position: PositionSnapshot,
    pub last_price: f64,
    pub grid_interval: f64,
}

/// 剥头皮触发时平掉的仓位比例
pub const SCALP_CLOSE_FRACTION: f64 = 0.5;

pub struct RiskEngine {
    config: RiskSection,
    /// 止损/止盈触发后闩锁，仓位归零前不再重复触发
    exit_latched: bool,
    /// 资金保护当前是否处于暂停状态
    protection_active: bool,
    price_lock_latched: bool,
    /// smart剥头皮的连续逆向tick计数
    adverse_ticks: u32,
    last_tick_price: Option<f64>,
}

impl RiskEngine {
    pub fn new(config: RiskSection) -> Self {
        Self {
            config,
            exit_latched: false,
            protection_active: false,
            price_lock_latched: false,
            adverse_ticks: 0,
            last_tick_price: None,
        }
    }

    /// 资金保护当前是否要求暂停补格
    pub fn protection_active(&self) -> bool {
        self.protection_active
    }

    /// 评估一轮，返回第一个命中的动作
    pub fn evaluate(&mut self, ctx: &RiskContext) -> Option<RiskEventRecord> {
        let has_position = ctx.position.net_quantity.abs() > f64::EPSILON;
        if !has_position {
            // 仓位归零后解除离场闩锁
            self.exit_latched = false;
            self.adverse_ticks = 0;
        }

        let adverse = self.adverse_move(ctx);
        let favorable = -adverse;

        // 剥头皮的逆向tick统计在闩锁判断之前更新，保证连续性
        self.update_tick_direction(ctx);

        if let Some(event) = self.check_stop_loss(ctx, adverse, favorable, has_position) {
            return Some(event);
        }
        if let Some(event) = self.check_capital_protection(ctx, adverse, favorable, has_position) {
            return Some(event);
        }
        if let Some(event) = self.check_take_profit(ctx, adverse, favorable, has_position) {
            return Some(event);
        }
        if let Some(event) = self.check_price_lock(ctx, adverse, favorable, has_position) {
            return Some(event);
        }
        if let Some(event) = self.check_scalping(ctx, adverse, favorable, has_position) {
            return Some(event);
        }

        None
    }

    /// 逆向波动幅度：多头价格下行为正，空头镜像
    fn adverse_move(&self, ctx: &RiskContext) -> f64 {
        let entry = ctx.position.avg_entry_price;
        if entry <= 0.0 || ctx.last_price <= 0.0 {
            return 0.0;
        }
        if ctx.position.net_quantity >= 0.0 {
            (entry - ctx.last_price) / entry
        } else {
            (ctx.last_price - entry) / entry
        }
    }

    fn update_tick_direction(&mut self, ctx: &RiskContext) {
        if let Some(previous) = self.last_tick_price {
            let adverse_tick = if ctx.position.net_quantity >= 0.0 {
                ctx.last_price < previous
            } else {
                ctx.last_price > previous
            };
            if adverse_tick {
                self.adverse_ticks += 1;
            } else if ctx.last_price != previous {
                self.adverse_ticks = 0;
            }
        }
        self.last_tick_price = Some(ctx.last_price);
    }

    fn check_stop_loss(
        &mut self,
        _ctx: &RiskContext,
        adverse: f64,
        _favorable: f64,
        has_position: bool,
    ) -> Option<RiskEventRecord> {
        let cfg = &self.config.stop_loss;
        if !cfg.enabled || !has_position || self.exit_latched {
            return None;
        }
        if adverse < cfg.trigger_percent {
            return None;
        }

        self.exit_latched = true;
        Some(RiskEventRecord {
            timestamp: Utc::now(),
            controller: "stop_loss",
            action: RiskAction::CancelAndExit,
            reason: format!(
                "逆向波动 {:.2}% 超过止损阈值 {:.2}%",
                adverse * 100.0,
                cfg.trigger_percent * 100.0
            ),
        })
    }

    fn check_capital_protection(
        &mut self,
        _ctx: &RiskContext,
        adverse: f64,
        _favorable: f64,
        has_position: bool,
    ) -> Option<RiskEventRecord> {
        let cfg = &self.config.capital_protection;
        if !cfg.enabled || !has_position {
            return None;
        }

        if adverse >= cfg.trigger_percent {
            if self.protection_active {
                return None; // 已经在暂停状态，不重复上报
            }
            self.protection_active = true;
            return Some(RiskEventRecord {
                timestamp: Utc::now(),
                controller: "capital_protection",
                action: RiskAction::PauseReplenishment,
                reason: format!(
                    "逆向波动 {:.2}% 触发资金保护，暂停补格",
                    adverse * 100.0
                ),
            });
        }

        // 回到阈值以内，下一轮恢复由协调器处理
        self.protection_active = false;
        None
    }

    fn check_take_profit(
        &mut self,
        _ctx: &RiskContext,
        _adverse: f64,
        favorable: f64,
        has_position: bool,
    ) -> Option<RiskEventRecord> {
        let cfg = &self.config.take_profit;
        if !cfg.enabled || !has_position || self.exit_latched {
            return None;
        }
        if favorable < cfg.trigger_percent {
            return None;
        }

        self.exit_latched = true;
        Some(RiskEventRecord {
            timestamp: Utc::now(),
            controller: "take_profit",
            action: RiskAction::CancelAndExit,
            reason: format!(
                "盈利 {:.2}% 达到止盈阈值 {:.2}%",
                favorable * 100.0,
                cfg.trigger_percent * 100.0
            ),
        })
    }

    fn check_price_lock(
        &mut self,
        ctx: &RiskContext,
        _adverse: f64,
        _favorable: f64,
        _has_position: bool,
    ) -> Option<RiskEventRecord> {
        let cfg = &self.config.price_lock;
        if !cfg.enabled || self.price_lock_latched {
            return None;
        }

        // 多头向上越过阈值、空头向下越过阈值都视为需要锁住有利侧
        let crossed = if ctx.position.net_quantity >= 0.0 {
            ctx.last_price >= cfg.threshold
        } else {
            ctx.last_price <= cfg.threshold
        };
        if !crossed {
            return None;
        }

        self.price_lock_latched = true;
        Some(RiskEventRecord {
            timestamp: Utc::now(),
            controller: "price_lock",
            action: RiskAction::CancelAndReplenish,
            reason: format!(
                "价格 {:.4} 越过锁定阈值 {:.4}，冻结有利侧扩张",
                ctx.last_price, cfg.threshold
            ),
        })
    }

    fn check_scalping(
        &mut self,
        ctx: &RiskContext,
        _adverse: f64,
        _favorable: f64,
        has_position: bool,
    ) -> Option<RiskEventRecord> {
        let cfg = &self.config.scalping;
        if !cfg.enabled || !has_position {
            return None;
        }

        let reference = match ctx.position.last_fill_price {
            Some(price) if price > 0.0 => price,
            _ => return None,
        };

        // 距最近一笔成交的有利方向移动量（价格单位）
        let direction = ctx.position.net_quantity.signum();
        let move_amount = (ctx.last_price - reference) * direction;
        let threshold = cfg.trigger_ratio * ctx.grid_interval;
        if move_amount < threshold {
            return None;
        }

        if cfg.smart {
            // smart变体：利润到位后等回撤确认，容忍 allowed_deep_drops
            // 次连续逆向tick再出手，避免单次噪声触发
            if self.adverse_ticks < cfg.allowed_deep_drops {
                return None;
            }
        }

        self.adverse_ticks = 0;
        Some(RiskEventRecord {
            timestamp: Utc::now(),
            controller: "scalping",
            action: RiskAction::CancelAndReplenish,
            reason: format!(
                "半格获利 {:.4} 超过 {:.4}，部分止盈",
                move_amount, threshold
            ),
        })
    }
}
