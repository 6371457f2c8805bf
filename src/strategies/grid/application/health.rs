//! 周期性对账
//!
//! 独立于下单路径，按固定周期拉取交易所侧的挂单与仓位，与本地
//! 信念比对。单次快照的偏差可能只是检查瞬间刚成交的竞态，必须在
//! 连续 confirm_snapshots 个快照中持续出现才算真实偏差。仓位级
//! 偏差升级为信任破坏事件，连续干净快照后才解除。

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::core::exchange::ExchangeClient;
use crate::core::types::{Order, Position, Result};
use crate::strategies::grid::domain::config::HealthSection;
use crate::strategies::grid::domain::position::PositionCorrection;
use crate::strategies::grid::domain::state::OrderRecord;

/// 一次对账观察到的偏差
#[derive(Debug, Clone, PartialEq)]
pub enum Drift {
    /// 交易所有本地不知道的挂单 → 收编
    MissingLocal { exchange_order_id: String },
    /// 本地认为在场的挂单交易所已没有 → 按成交历史标记
    MissingExchange { client_order_id: String },
    /// 仓位偏差超出容忍度
    PositionMismatch { local: f64, exchange: f64 },
}

impl Drift {
    /// 跨快照比较持续性的标识
    fn key(&self) -> String {
        match self {
            Drift::MissingLocal { exchange_order_id } => format!("L:{}", exchange_order_id),
            Drift::MissingExchange { client_order_id } => format!("E:{}", client_order_id),
            Drift::PositionMismatch { .. } => "P".to_string(),
        }
    }
}

/// 对账快照，保留短滚动历史
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub exchange_orders: Vec<Order>,
    pub exchange_position: Option<Position>,
    pub drifts: Vec<Drift>,
    /// 采集时本地已应用的成交序号
    pub fill_watermark: u64,
}

/// 上报给协调器的修正，对账本身从不直接改状态
#[derive(Debug, Clone)]
pub enum Correction {
    AdoptOrder(Order),
    MarkOrderGone {
        client_order_id: String,
        filled: bool,
    },
    Position(PositionCorrection),
}

/// 一轮对账的结论
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub corrections: Vec<Correction>,
    /// 本轮新升级的信任破坏
    pub trust_breach: bool,
    /// 连续干净快照后信任恢复
    pub trust_restored: bool,
}

/// 本地信念的只读快照，由协调器在对账前采集
#[derive(Debug, Clone)]
pub struct LocalBelief {
    pub live_orders: Vec<OrderRecord>,
    pub net_quantity: f64,
    pub fill_watermark: u64,
}

/// 比对本地与交易所状态，纯函数
pub fn classify_drifts(
    local_orders: &[OrderRecord],
    local_net: f64,
    exchange_orders: &[Order],
    exchange_net: f64,
    position_tolerance: f64,
) -> Vec<Drift> {
    let mut drifts = Vec::new();

    let local_client_ids: HashSet<&str> = local_orders
        .iter()
        .map(|o| o.client_order_id.as_str())
        .collect();
    let local_exchange_ids: HashSet<&str> = local_orders
        .iter()
        .filter_map(|o| o.exchange_order_id.as_deref())
        .collect();

    for order in exchange_orders {
        let known_by_client = order
            .client_order_id
            .as_deref()
            .map(|c| local_client_ids.contains(c))
            .unwrap_or(false);
        if !known_by_client && !local_exchange_ids.contains(order.id.as_str()) {
            drifts.push(Drift::MissingLocal {
                exchange_order_id: order.id.clone(),
            });
        }
    }

    let exchange_client_ids: HashSet<&str> = exchange_orders
        .iter()
        .filter_map(|o| o.client_order_id.as_deref())
        .collect();
    let exchange_ids: HashSet<&str> = exchange_orders.iter().map(|o| o.id.as_str()).collect();

    for record in local_orders {
        let still_there = exchange_client_ids.contains(record.client_order_id.as_str())
            || record
                .exchange_order_id
                .as_deref()
                .map(|id| exchange_ids.contains(id))
                .unwrap_or(false);
        if !still_there {
            drifts.push(Drift::MissingExchange {
                client_order_id: record.client_order_id.clone(),
            });
        }
    }

    if (local_net - exchange_net).abs() > position_tolerance {
        drifts.push(Drift::PositionMismatch {
            local: local_net,
            exchange: exchange_net,
        });
    }

    drifts
}

pub struct HealthReconciler {
    config: HealthSection,
    history: VecDeque<HealthSnapshot>,
    /// 每个偏差episode只升级一次
    reported: HashSet<String>,
    escalated: bool,
    clean_streak: u32,
}

impl HealthReconciler {
    pub fn new(config: HealthSection) -> Self {
        Self {
            history: VecDeque::with_capacity(config.confirm_snapshots as usize + 1),
            config,
            reported: HashSet::new(),
            escalated: false,
            clean_streak: 0,
        }
    }

    /// 执行一轮对账：拉取交易所状态、入窗、产出确认过的修正
    pub async fn run_once(
        &mut self,
        exchange: &Arc<dyn ExchangeClient>,
        symbol: &str,
        belief: LocalBelief,
    ) -> Result<ReconcileReport> {
        let exchange_orders = exchange.get_open_orders(symbol).await?;
        let exchange_position = exchange.get_position(symbol).await?;
        let exchange_net = exchange_position.as_ref().map(|p| p.amount).unwrap_or(0.0);

        let drifts = classify_drifts(
            &belief.live_orders,
            belief.net_quantity,
            &exchange_orders,
            exchange_net,
            self.config.position_tolerance,
        );

        if !drifts.is_empty() {
            log::info!(
                "🔍 对账发现 {} 项偏差（待连续确认）: {:?}",
                drifts.len(),
                drifts
            );
        }

        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            exchange_orders,
            exchange_position,
            drifts,
            fill_watermark: belief.fill_watermark,
        };

        let confirmed = self.push_snapshot(snapshot);
        self.build_report(exchange, symbol, confirmed).await
    }

    /// 快照入窗，返回在整个确认窗口内持续存在的偏差键
    fn push_snapshot(&mut self, snapshot: HealthSnapshot) -> Vec<String> {
        let window = self.config.confirm_snapshots as usize;
        self.history.push_back(snapshot);
        while self.history.len() > window {
            self.history.pop_front();
        }

        // 当前不存在的偏差episode结束，允许将来再次上报
        let current_keys: HashSet<String> = self
            .history
            .back()
            .map(|s| s.drifts.iter().map(Drift::key).collect())
            .unwrap_or_default();
        self.reported.retain(|key| current_keys.contains(key));

        if self.history.len() < window {
            return Vec::new();
        }

        // 必须在窗口内每个快照都出现才算确认
        let mut confirmed: Vec<String> = current_keys
            .into_iter()
            .filter(|key| {
                self.history
                    .iter()
                    .all(|s| s.drifts.iter().any(|d| &d.key() == key))
            })
            .collect();
        confirmed.sort();
        confirmed
    }

    async fn build_report(
        &mut self,
        exchange: &Arc<dyn ExchangeClient>,
        symbol: &str,
        confirmed: Vec<String>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let latest = match self.history.back() {
            Some(snapshot) => snapshot.clone(),
            None => return Ok(report),
        };

        let position_clean = !latest
            .drifts
            .iter()
            .any(|d| matches!(d, Drift::PositionMismatch { .. }));

        for key in confirmed {
            let drift = match latest.drifts.iter().find(|d| d.key() == key) {
                Some(drift) => drift.clone(),
                None => continue,
            };

            // 订单级偏差每个episode只处理一次；仓位修正在偏差持续期间
            // 每轮都重发，防止水位竞态让某一轮修正被跳过后再也补不上
            let once_per_episode = !matches!(drift, Drift::PositionMismatch { .. });
            if once_per_episode && self.reported.contains(&key) {
                continue;
            }

            match drift {
                Drift::MissingLocal { exchange_order_id } => {
                    if let Some(order) = latest
                        .exchange_orders
                        .iter()
                        .find(|o| o.id == exchange_order_id)
                    {
                        log::warn!("⚠️ 对账收编未知挂单: {}", exchange_order_id);
                        report.corrections.push(Correction::AdoptOrder(order.clone()));
                    }
                }
                Drift::MissingExchange { client_order_id } => {
                    // 查成交历史区分成交与撤销
                    let fills = exchange.get_recent_fills(symbol, Some(100)).await?;
                    let filled = fills
                        .iter()
                        .any(|f| f.client_order_id.as_deref() == Some(&client_order_id));
                    log::warn!(
                        "⚠️ 本地挂单 {} 在交易所已不存在，判定为{}",
                        client_order_id,
                        if filled { "已成交" } else { "已撤销" }
                    );
                    report.corrections.push(Correction::MarkOrderGone {
                        client_order_id,
                        filled,
                    });
                }
                Drift::PositionMismatch { local, exchange } => {
                    let entry_price = latest
                        .exchange_position
                        .as_ref()
                        .map(|p| p.entry_price)
                        .unwrap_or(0.0);
                    log::error!(
                        "❌ 仓位偏差确认: 本地 {:.8} vs 交易所 {:.8}，升级信任破坏",
                        local,
                        exchange
                    );
                    report.corrections.push(Correction::Position(PositionCorrection {
                        net_quantity: exchange,
                        avg_entry_price: entry_price,
                        fill_watermark: latest.fill_watermark,
                    }));
                    if !self.escalated {
                        self.escalated = true;
                        report.trust_breach = true;
                    }
                }
            }

            if once_per_episode {
                self.reported.insert(key);
            }
        }

        // 信任恢复：连续 confirm_snapshots 个仓位干净的快照
        if self.escalated {
            if position_clean {
                self.clean_streak += 1;
                if self.clean_streak >= self.config.confirm_snapshots {
                    self.escalated = false;
                    self.clean_streak = 0;
                    report.trust_restored = true;
                    log::info!("✅ 连续{}次快照干净，信任恢复", self.config.confirm_snapshots);
                }
            } else {
                self.clean_streak = 0;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OrderSide;
    use crate::testkit::MockExchange;

    fn record(client_id: &str, exchange_id: &str, index: i64) -> OrderRecord {
        OrderRecord {
            client_order_id: client_id.to_string(),
            exchange_order_id: Some(exchange_id.to_string()),
            index,
            side: OrderSide::Buy,
            price: 9400.0,
            amount: 0.01,
            status: crate::core::types::OrderStatus::Open,
            created_at: Utc::now(),
            last_update: Utc::now(),
        }
    }

    fn belief(orders: Vec<OrderRecord>, net: f64) -> LocalBelief {
        LocalBelief {
            live_orders: orders,
            net_quantity: net,
            fill_watermark: 0,
        }
    }

    #[test]
    fn test_classify_all_drift_classes() {
        let local = vec![record("GRD1", "100", 4)];
        let exchange_order = Order {
            id: "200".to_string(),
            client_order_id: Some("EXT9".to_string()),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: crate::core::types::OrderType::Limit,
            amount: 0.01,
            price: Some(9600.0),
            filled: 0.0,
            remaining: 0.01,
            status: crate::core::types::OrderStatus::Open,
            market_type: crate::core::types::MarketType::Futures,
            timestamp: Utc::now(),
            last_update: None,
        };

        let drifts = classify_drifts(&local, 0.5, &[exchange_order], 0.3, 1e-8);
        assert_eq!(drifts.len(), 3);
        assert!(drifts
            .iter()
            .any(|d| matches!(d, Drift::MissingLocal { exchange_order_id } if exchange_order_id == "200")));
        assert!(drifts
            .iter()
            .any(|d| matches!(d, Drift::MissingExchange { client_order_id } if client_order_id == "GRD1")));
        assert!(drifts
            .iter()
            .any(|d| matches!(d, Drift::PositionMismatch { .. })));
    }

    #[test]
    fn test_within_tolerance_is_clean() {
        let drifts = classify_drifts(&[], 0.5, &[], 0.5 + 1e-10, 1e-8);
        assert!(drifts.is_empty());
    }

    /// 单次快照偏差在第二个快照自愈时绝不升级
    #[tokio::test]
    async fn test_transient_mismatch_does_not_escalate() {
        let exchange: Arc<dyn ExchangeClient> = Arc::new(MockExchange::new("BTCUSDT"));
        let mut reconciler = HealthReconciler::new(HealthSection::default());

        // 第一轮：本地以为有0.5仓位，交易所为空 → 偏差但未确认
        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.5))
            .await
            .unwrap();
        assert!(report.corrections.is_empty());
        assert!(!report.trust_breach);

        // 第二轮：成交推送赶到本地归零，偏差自愈 → 依然无动作
        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.0))
            .await
            .unwrap();
        assert!(report.corrections.is_empty());
        assert!(!report.trust_breach);
    }

    /// 连续两个快照的偏差升级且只升级一次
    #[tokio::test]
    async fn test_persistent_mismatch_escalates_exactly_once() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        mock.set_position(0.3, 9400.0);
        let exchange: Arc<dyn ExchangeClient> = mock.clone();
        let mut reconciler = HealthReconciler::new(HealthSection::default());

        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.5))
            .await
            .unwrap();
        assert!(!report.trust_breach);

        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.5))
            .await
            .unwrap();
        assert!(report.trust_breach);
        assert_eq!(report.corrections.len(), 1);
        match &report.corrections[0] {
            Correction::Position(c) => {
                assert_eq!(c.net_quantity, 0.3);
                assert_eq!(c.avg_entry_price, 9400.0);
            }
            other => panic!("意外的修正: {:?}", other),
        }

        // 第三轮偏差仍在：修正继续重发，但信任破坏不再重复升级
        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.5))
            .await
            .unwrap();
        assert!(!report.trust_breach);
        assert_eq!(report.corrections.len(), 1);
    }

    /// 信任破坏后连续干净快照恢复
    #[tokio::test]
    async fn test_trust_restored_after_clean_streak() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        mock.set_position(0.3, 9400.0);
        let exchange: Arc<dyn ExchangeClient> = mock.clone();
        let mut reconciler = HealthReconciler::new(HealthSection::default());

        for _ in 0..2 {
            reconciler
                .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.5))
                .await
                .unwrap();
        }

        // 本地修正到0.3后快照变干净，连续2次后恢复
        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.3))
            .await
            .unwrap();
        assert!(!report.trust_restored);
        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.3))
            .await
            .unwrap();
        assert!(report.trust_restored);
    }

    /// 收编交易所有而本地没有的挂单
    #[tokio::test]
    async fn test_adopts_unknown_exchange_order() {
        let mock = Arc::new(MockExchange::new("BTCUSDT"));
        let request = crate::core::types::OrderRequest::limit(
            "BTCUSDT".to_string(),
            OrderSide::Buy,
            0.01,
            9400.0,
            crate::core::types::MarketType::Futures,
            "EXT1".to_string(),
        );
        mock.create_order(request).await.unwrap();

        let exchange: Arc<dyn ExchangeClient> = mock.clone();
        let mut reconciler = HealthReconciler::new(HealthSection::default());

        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.0))
            .await
            .unwrap();
        assert!(report.corrections.is_empty());

        let report = reconciler
            .run_once(&exchange, "BTCUSDT", belief(Vec::new(), 0.0))
            .await
            .unwrap();
        assert_eq!(report.corrections.len(), 1);
        assert!(matches!(
            &report.corrections[0],
            Correction::AdoptOrder(order) if order.client_order_id.as_deref() == Some("EXT1")
        ));
        // 订单级偏差不构成信任破坏
        assert!(!report.trust_breach);
    }
}
