//! 网格梯子的纯算法部分
//!
//! 价格↔索引的换算、固定/跟随边界、马丁格尔数量放大都在这里，
//! 不持有任何锁与IO。量化只发生在本模块和 core::types。

use crate::core::types::{quantize_amount, quantize_price, OrderSide};

use super::config::{FollowSection, GridMode, GridSection};

/// 价格梯子：以 base_price 为索引0，按固定价差向两端延伸
#[derive(Debug, Clone, PartialEq)]
pub struct Ladder {
    base_price: f64,
    interval: f64,
    price_decimals: u32,
    min_index: i64,
    max_index: i64,
}

impl Ladder {
    /// 固定区间模式：下边界为索引0，覆盖整个 [lower, upper]
    pub fn from_fixed_range(lower: f64, upper: f64, interval: f64, price_decimals: u32) -> Self {
        let base_price = quantize_price(lower, price_decimals);
        // 半格补偿吸收浮点误差，区间端点落格
        let count = ((upper - lower) / interval + 0.5).floor() as i64;
        Self {
            base_price,
            interval,
            price_decimals,
            min_index: 0,
            max_index: count.max(1),
        }
    }

    /// 跟随模式：边界由实时参考价推出，量化后才生效
    ///
    /// 多头: upper = ref + offset*interval, lower = upper - count*interval；
    /// 空头以 lower 为镜像。相同参考价重算得到相同梯子。
    pub fn from_follow(
        mode: GridMode,
        reference_price: f64,
        follow: &FollowSection,
        interval: f64,
        price_decimals: u32,
    ) -> Self {
        let span = follow.grid_count as f64 * interval;
        let offset = follow.price_offset_grids as f64 * interval;

        let lower = if mode.is_long() {
            let upper = quantize_price(reference_price + offset, price_decimals);
            quantize_price(upper - span, price_decimals)
        } else {
            quantize_price(reference_price - offset, price_decimals)
        };

        Self {
            base_price: lower,
            interval,
            price_decimals,
            min_index: 0,
            max_index: follow.grid_count as i64,
        }
    }

    pub fn price_at(&self, index: i64) -> f64 {
        quantize_price(
            self.base_price + index as f64 * self.interval,
            self.price_decimals,
        )
    }

    /// 最接近 price 的索引，恰好居中时取较小索引，并收敛到有效区间
    pub fn index_at(&self, price: f64) -> i64 {
        let raw = (price - self.base_price) / self.interval;
        let index = (raw - 0.5).ceil() as i64;
        index.clamp(self.min_index, self.max_index)
    }

    pub fn min_index(&self) -> i64 {
        self.min_index
    }

    pub fn max_index(&self) -> i64 {
        self.max_index
    }

    pub fn lower_price(&self) -> f64 {
        self.price_at(self.min_index)
    }

    pub fn upper_price(&self) -> f64 {
        self.price_at(self.max_index)
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn indices(&self) -> impl Iterator<Item = i64> {
        self.min_index..=self.max_index
    }

    pub fn contains_price(&self, price: f64) -> bool {
        price >= self.lower_price() && price <= self.upper_price()
    }

    /// 跟随模式下价格越出边界 follow_distance 以上需要重算
    pub fn needs_follow_recompute(&self, price: f64, follow_distance: f64) -> bool {
        price > self.upper_price() + follow_distance
            || price < self.lower_price() - follow_distance
    }
}

/// 单个格位的下单计划
#[derive(Debug, Clone, PartialEq)]
pub struct LevelPlan {
    pub index: i64,
    pub price: f64,
    pub side: OrderSide,
    /// 平仓侧挂单只减仓
    pub reduce_only: bool,
    pub amount: f64,
}

/// 某一格的下单数量：马丁格尔模式按离原点格数放大
pub fn level_amount(grid: &GridSection, index: i64, origin_index: i64) -> f64 {
    let mut amount = grid.order_amount;
    if grid.mode.is_martingale() {
        let distance = (index - origin_index).unsigned_abs().min(32) as i32;
        amount *= grid.martingale_factor.powi(distance);
    }
    quantize_amount(amount, grid.amount_precision)
}

/// 给出当前价下应挂满的全部格位
///
/// 多头网格在价格下方挂买单开仓、上方挂只减仓卖单；空头镜像。
/// 距当前价最近的格位留空，避免即时成交。
pub fn plan_levels(
    grid: &GridSection,
    ladder: &Ladder,
    current_price: f64,
    origin_index: i64,
) -> Vec<LevelPlan> {
    let current_index = ladder.index_at(current_price);
    let mut plans = Vec::with_capacity((ladder.max_index() - ladder.min_index()) as usize);

    for index in ladder.indices() {
        if index == current_index {
            continue;
        }

        let price = ladder.price_at(index);
        let below = index < current_index;
        let (side, reduce_only) = if grid.mode.is_long() {
            if below {
                (OrderSide::Buy, false)
            } else {
                (OrderSide::Sell, true)
            }
        } else if below {
            (OrderSide::Buy, true)
        } else {
            (OrderSide::Sell, false)
        };

        plans.push(LevelPlan {
            index,
            price,
            side,
            reduce_only,
            amount: level_amount(grid, index, origin_index),
        });
    }

    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::grid::domain::config::sample_config;

    fn sample_ladder() -> Ladder {
        Ladder::from_fixed_range(9000.0, 10000.0, 100.0, 2)
    }

    #[test]
    fn test_round_trip_law() {
        let ladder = sample_ladder();
        for index in ladder.indices() {
            assert_eq!(ladder.index_at(ladder.price_at(index)), index);
        }
    }

    #[test]
    fn test_spacing_invariant() {
        let ladder = sample_ladder();
        for index in ladder.min_index()..ladder.max_index() {
            let diff = ladder.price_at(index + 1) - ladder.price_at(index);
            assert_eq!(quantize_price(diff, 2), 100.0);
        }

        // 非整数价位同样成立
        let ladder = Ladder::from_fixed_range(0.1234, 0.2034, 0.0025, 4);
        for index in ladder.min_index()..ladder.max_index() {
            let diff = ladder.price_at(index + 1) - ladder.price_at(index);
            assert_eq!(quantize_price(diff, 4), 0.0025);
        }
    }

    #[test]
    fn test_scenario_9500_has_exact_neighbors() {
        // 配置 {interval=100, range=[9000,10000]}，现价9500
        let ladder = sample_ladder();
        let index = ladder.index_at(9500.0);
        assert_eq!(ladder.price_at(index), 9500.0);
        assert_eq!(ladder.price_at(index - 1), 9400.0);
        assert_eq!(ladder.price_at(index + 1), 9600.0);
    }

    #[test]
    fn test_tie_resolves_to_lower_index() {
        let ladder = sample_ladder();
        // 9450 恰好位于 9400 与 9500 中点
        let index = ladder.index_at(9450.0);
        assert_eq!(ladder.price_at(index), 9400.0);
    }

    #[test]
    fn test_index_clamped_to_range() {
        let ladder = sample_ladder();
        assert_eq!(ladder.index_at(8000.0), ladder.min_index());
        assert_eq!(ladder.index_at(12000.0), ladder.max_index());
    }

    fn sample_follow() -> FollowSection {
        FollowSection {
            grid_count: 10,
            follow_distance: 200.0,
            recompute_timeout_secs: 300,
            price_offset_grids: 2,
        }
    }

    #[test]
    fn test_follow_recompute_idempotent() {
        let follow = sample_follow();
        let first = Ladder::from_follow(GridMode::FollowLong, 9513.27, &follow, 100.0, 2);
        let second = Ladder::from_follow(GridMode::FollowLong, 9513.27, &follow, 100.0, 2);
        assert_eq!(first, second);

        // 多头: upper = ref + 2格, lower = upper - 10格
        assert_eq!(first.upper_price(), 9713.27);
        assert_eq!(first.lower_price(), 8713.27);
    }

    #[test]
    fn test_follow_short_mirrors_around_lower() {
        let follow = sample_follow();
        let ladder = Ladder::from_follow(GridMode::FollowShort, 9500.0, &follow, 100.0, 2);
        assert_eq!(ladder.lower_price(), 9300.0);
        assert_eq!(ladder.upper_price(), 10300.0);
    }

    #[test]
    fn test_follow_boundary_trigger() {
        let follow = sample_follow();
        let ladder = Ladder::from_follow(GridMode::FollowLong, 9500.0, &follow, 100.0, 2);
        assert!(!ladder.needs_follow_recompute(9750.0, follow.follow_distance));
        assert!(ladder.needs_follow_recompute(ladder.upper_price() + 201.0, follow.follow_distance));
        assert!(ladder.needs_follow_recompute(ladder.lower_price() - 201.0, follow.follow_distance));
    }

    #[test]
    fn test_plan_levels_long_sides() {
        let config = sample_config();
        let ladder = sample_ladder();
        let plans = plan_levels(&config.grid, &ladder, 9500.0, ladder.index_at(9500.0));

        // 区间共11格，扣掉现价所在格剩10个计划
        assert_eq!(plans.len(), 10);
        for plan in &plans {
            if plan.price < 9500.0 {
                assert_eq!(plan.side, OrderSide::Buy);
                assert!(!plan.reduce_only);
            } else {
                assert_eq!(plan.side, OrderSide::Sell);
                assert!(plan.reduce_only);
            }
            assert_eq!(plan.amount, 0.01);
        }
    }

    #[test]
    fn test_martingale_scales_with_distance() {
        let mut config = sample_config();
        config.grid.mode = GridMode::MartingaleLong;
        config.grid.martingale_factor = 2.0;
        config.grid.amount_precision = 4;

        assert_eq!(level_amount(&config.grid, 5, 5), 0.01);
        assert_eq!(level_amount(&config.grid, 4, 5), 0.02);
        assert_eq!(level_amount(&config.grid, 7, 5), 0.04);
    }
}
