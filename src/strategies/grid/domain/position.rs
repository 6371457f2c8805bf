//! 仓位跟踪
//!
//! 消费成交流维护净仓/均价/已实现盈亏，本地跟踪只是为了让热路径
//! 不打REST；对账修正永远以交易所为准。

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::core::types::{Fill, OrderSide};

/// 仓位快照，风控与UI读取的只读视图
#[derive(Debug, Clone, Default)]
pub struct PositionSnapshot {
    /// 带符号净仓，多头为正
    pub net_quantity: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub last_price: f64,
    pub last_fill_price: Option<f64>,
}

/// 对账修正，携带快照采集时的成交序号水位
#[derive(Debug, Clone)]
pub struct PositionCorrection {
    pub net_quantity: f64,
    pub avg_entry_price: f64,
    /// 采集交易所快照时本地已应用的成交序号
    pub fill_watermark: u64,
}

pub struct PositionTracker {
    net_quantity: f64,
    avg_entry_price: f64,
    realized_pnl: f64,
    last_mark_price: f64,
    last_fill_price: Option<f64>,
    last_fill_at: Option<DateTime<Utc>>,
    applied_fill_ids: HashSet<String>,
    /// 每应用一笔成交递增，对账用水位
    fill_seq: u64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            net_quantity: 0.0,
            avg_entry_price: 0.0,
            realized_pnl: 0.0,
            last_mark_price: 0.0,
            last_fill_price: None,
            last_fill_at: None,
            applied_fill_ids: HashSet::new(),
            fill_seq: 0,
        }
    }

    pub fn fill_seq(&self) -> u64 {
        self.fill_seq
    }

    pub fn net_quantity(&self) -> f64 {
        self.net_quantity
    }

    /// 最近一次成交时间，对账与状态展示用
    pub fn last_fill_at(&self) -> Option<DateTime<Utc>> {
        self.last_fill_at
    }

    pub fn mark_price(&mut self, price: f64) {
        if price > 0.0 {
            self.last_mark_price = price;
        }
    }

    /// 应用一笔成交，重复的成交ID（重连后的乱序重放）直接忽略
    ///
    /// 加仓按数量加权更新均价，减仓按均价结算已实现盈亏，
    /// 反手时剩余数量以成交价开新仓。手续费直接从已实现盈亏扣除。
    pub fn apply_fill(&mut self, fill: &Fill) -> bool {
        if !self.applied_fill_ids.insert(fill.id.clone()) {
            log::debug!("重复成交已忽略: {}", fill.id);
            return false;
        }

        let signed = match fill.side {
            OrderSide::Buy => fill.amount,
            OrderSide::Sell => -fill.amount,
        };

        if self.net_quantity == 0.0 || self.net_quantity.signum() == signed.signum() {
            // 开仓/加仓：数量加权均价
            let total = self.net_quantity.abs() + fill.amount;
            if total > 0.0 {
                self.avg_entry_price = (self.avg_entry_price * self.net_quantity.abs()
                    + fill.price * fill.amount)
                    / total;
            }
            self.net_quantity += signed;
        } else {
            // 减仓或反手
            let closing = fill.amount.min(self.net_quantity.abs());
            let direction = self.net_quantity.signum();
            self.realized_pnl += (fill.price - self.avg_entry_price) * closing * direction;

            let remainder = fill.amount - closing;
            self.net_quantity += signed;
            if remainder > 0.0 {
                // 反手，剩余数量以本次成交价作为新均价
                self.avg_entry_price = fill.price;
            } else if self.net_quantity == 0.0 {
                self.avg_entry_price = 0.0;
            }
        }

        self.realized_pnl -= fill.fee;
        self.last_fill_price = Some(fill.price);
        self.last_fill_at = Some(fill.timestamp);
        self.last_mark_price = fill.price;
        self.fill_seq += 1;

        log::debug!(
            "成交已应用: {} {} {}@{} 净仓={:.8} 均价={:.4}",
            fill.id,
            fill.side,
            fill.amount,
            fill.price,
            self.net_quantity,
            self.avg_entry_price
        );
        true
    }

    /// 应用对账修正
    ///
    /// 交易所是事实来源，但快照采集后本地又有新成交时说明REST数据
    /// 已过期，跳过等下一轮对账，避免旧数据覆盖新状态。
    pub fn apply_correction(&mut self, correction: &PositionCorrection) -> bool {
        if correction.fill_watermark != self.fill_seq {
            log::info!(
                "对账修正过期(水位 {} != 当前 {})，跳过本轮",
                correction.fill_watermark,
                self.fill_seq
            );
            return false;
        }

        log::warn!(
            "⚠️ 对账修正仓位: {:.8} -> {:.8} (均价 {:.4} -> {:.4})",
            self.net_quantity,
            correction.net_quantity,
            self.avg_entry_price,
            correction.avg_entry_price
        );
        self.net_quantity = correction.net_quantity;
        self.avg_entry_price = correction.avg_entry_price;
        true
    }

    pub fn unrealized_pnl(&self) -> f64 {
        if self.net_quantity == 0.0 || self.last_mark_price <= 0.0 {
            return 0.0;
        }
        (self.last_mark_price - self.avg_entry_price) * self.net_quantity
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            net_quantity: self.net_quantity,
            avg_entry_price: self.avg_entry_price,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(),
            last_price: self.last_mark_price,
            last_fill_price: self.last_fill_price,
        }
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(id: &str, side: OrderSide, amount: f64, price: f64, fee: f64) -> Fill {
        Fill {
            id: id.to_string(),
            order_id: format!("o-{}", id),
            client_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side,
            price,
            amount,
            fee,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_matched_buy_sell_realizes_exact_pnl() {
        // 等量先买后卖，已实现盈亏 = (P2-P1)*qty - 手续费
        let fee_rate = 0.0004;
        let (p1, p2, qty) = (9400.0, 9600.0, 0.5);
        let mut tracker = PositionTracker::new();

        tracker.apply_fill(&fill("1", OrderSide::Buy, qty, p1, p1 * qty * fee_rate));
        tracker.apply_fill(&fill("2", OrderSide::Sell, qty, p2, p2 * qty * fee_rate));

        let expected = (p2 - p1) * qty - (p1 + p2) * qty * fee_rate;
        let snapshot = tracker.snapshot();
        assert!((snapshot.realized_pnl - expected).abs() < 1e-9);
        assert_eq!(snapshot.net_quantity, 0.0);
        assert_eq!(snapshot.avg_entry_price, 0.0);
    }

    #[test]
    fn test_weighted_average_on_increase() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill(&fill("1", OrderSide::Buy, 1.0, 100.0, 0.0));
        tracker.apply_fill(&fill("2", OrderSide::Buy, 1.0, 110.0, 0.0));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.net_quantity, 2.0);
        assert!((snapshot.avg_entry_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_reversal_opens_at_fill_price() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill(&fill("1", OrderSide::Buy, 1.0, 100.0, 0.0));
        // 卖出3个：平掉1个多头、反手2个空头
        tracker.apply_fill(&fill("2", OrderSide::Sell, 3.0, 120.0, 0.0));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.net_quantity, -2.0);
        assert_eq!(snapshot.avg_entry_price, 120.0);
        assert!((snapshot.realized_pnl - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_fill_ignored() {
        let mut tracker = PositionTracker::new();
        let f = fill("1", OrderSide::Buy, 1.0, 100.0, 0.0);
        assert!(tracker.apply_fill(&f));
        assert!(!tracker.apply_fill(&f));
        assert_eq!(tracker.snapshot().net_quantity, 1.0);
        assert_eq!(tracker.fill_seq(), 1);
    }

    #[test]
    fn test_correction_wins_only_at_watermark() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill(&fill("1", OrderSide::Buy, 1.0, 100.0, 0.0));

        // 过期水位（快照后又有了新成交）被拒绝
        let stale = PositionCorrection {
            net_quantity: 0.0,
            avg_entry_price: 0.0,
            fill_watermark: 0,
        };
        assert!(!tracker.apply_correction(&stale));
        assert_eq!(tracker.snapshot().net_quantity, 1.0);

        // 当前水位的修正生效，交易所为准
        let fresh = PositionCorrection {
            net_quantity: 2.5,
            avg_entry_price: 99.0,
            fill_watermark: 1,
        };
        assert!(tracker.apply_correction(&fresh));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.net_quantity, 2.5);
        assert_eq!(snapshot.avg_entry_price, 99.0);
    }

    #[test]
    fn test_unrealized_tracks_mark_price() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill(&fill("1", OrderSide::Buy, 2.0, 100.0, 0.0));
        tracker.mark_price(110.0);
        assert!((tracker.unrealized_pnl() - 20.0).abs() < 1e-9);

        tracker.mark_price(90.0);
        assert!((tracker.unrealized_pnl() + 20.0).abs() < 1e-9);
    }
}
