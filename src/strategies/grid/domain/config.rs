use serde::{Deserialize, Serialize};

use crate::core::error::ExchangeError;
use crate::core::types::{quantize_amount, quantize_price, MarginMode, MarketType};

/// 网格模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    FixedLong,
    FixedShort,
    FollowLong,
    FollowShort,
    MartingaleLong,
    MartingaleShort,
}

impl GridMode {
    pub fn is_long(self) -> bool {
        matches!(
            self,
            GridMode::FixedLong | GridMode::FollowLong | GridMode::MartingaleLong
        )
    }

    pub fn is_follow(self) -> bool {
        matches!(self, GridMode::FollowLong | GridMode::FollowShort)
    }

    pub fn is_martingale(self) -> bool {
        matches!(self, GridMode::MartingaleLong | GridMode::MartingaleShort)
    }
}

/// 策略元信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySection {
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// 交易所接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSection {
    /// 交易所标识: binance / okx
    pub id: String,
    pub market_type: MarketType,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    10
}

/// 跟随模式参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowSection {
    /// 网格数量
    pub grid_count: u32,
    /// 价格越过边界多远触发重算（价格单位）
    pub follow_distance: f64,
    /// 定时重算周期（秒）
    pub recompute_timeout_secs: u64,
    /// 上边界相对参考价的偏移（格数）
    pub price_offset_grids: i64,
}

/// 网格参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSection {
    pub mode: GridMode,
    /// 相邻格的价差（价格单位，正数）
    pub interval: f64,
    /// 每格下单数量（基础币）
    pub order_amount: f64,
    /// 固定模式的价格区间
    #[serde(default)]
    pub lower_price: Option<f64>,
    #[serde(default)]
    pub upper_price: Option<f64>,
    /// 跟随模式参数
    #[serde(default)]
    pub follow: Option<FollowSection>,
    pub price_decimals: u32,
    pub amount_precision: u32,
    /// 成交手续费率
    #[serde(default)]
    pub fee_rate: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,
    /// 马丁格尔模式的逐格放大系数
    #[serde(default = "default_martingale_factor")]
    pub martingale_factor: f64,
}

fn default_leverage() -> u32 {
    1
}

fn default_margin_mode() -> MarginMode {
    MarginMode::Cross
}

fn default_martingale_factor() -> f64 {
    1.0
}

/// 止损配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossSection {
    #[serde(default)]
    pub enabled: bool,
    /// 逆向波动触发阈值（0.05 = 5%）
    pub trigger_percent: f64,
    /// 限价逃逸的时间窗口，超时升级为市价离场
    #[serde(default = "default_escape_timeout")]
    pub escape_timeout_secs: u64,
}

fn default_escape_timeout() -> u64 {
    30
}

/// 资金保护配置：比止损更浅的阈值，只暂停补格不强制离场
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalProtectionSection {
    #[serde(default)]
    pub enabled: bool,
    pub trigger_percent: f64,
}

/// 止盈配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitSection {
    #[serde(default)]
    pub enabled: bool,
    pub trigger_percent: f64,
}

/// 锁价配置：越过阈值后冻结有利侧的网格扩张
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLockSection {
    #[serde(default)]
    pub enabled: bool,
    pub threshold: f64,
}

/// 剥头皮配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpingSection {
    #[serde(default)]
    pub enabled: bool,
    /// smart 变体容忍连续逆向跳动，减少噪声误触发
    #[serde(default)]
    pub smart: bool,
    /// 触发阈值，按一格价差的比例（0.5 = 半格）
    #[serde(default = "default_scalp_ratio")]
    pub trigger_ratio: f64,
    /// smart 变体允许的连续逆向跳动次数
    #[serde(default = "default_deep_drops")]
    pub allowed_deep_drops: u32,
}

fn default_scalp_ratio() -> f64 {
    0.5
}

fn default_deep_drops() -> u32 {
    3
}

/// 风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSection {
    pub stop_loss: StopLossSection,
    pub capital_protection: CapitalProtectionSection,
    pub take_profit: TakeProfitSection,
    pub price_lock: PriceLockSection,
    pub scalping: ScalpingSection,
}

/// 流连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_miss_limit")]
    pub heartbeat_miss_limit: u32,
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    20
}
fn default_heartbeat_miss_limit() -> u32 {
    3
}
fn default_reconnect_initial() -> u64 {
    500
}
fn default_reconnect_max() -> u64 {
    30_000
}
fn default_subscribe_timeout() -> u64 {
    10
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_miss_limit: default_heartbeat_miss_limit(),
            reconnect_initial_delay_ms: default_reconnect_initial(),
            reconnect_max_delay_ms: default_reconnect_max(),
            subscribe_timeout_secs: default_subscribe_timeout(),
        }
    }
}

/// 对账配置
///
/// 单次快照的偏差可能只是成交竞态，必须连续 confirm_snapshots 次
/// 观察到同一偏差才升级，窗口大小与节奏都是显式配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_confirm_snapshots")]
    pub confirm_snapshots: u32,
    /// 仓位偏差容忍度（基础币数量）
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
}

fn default_health_interval() -> u64 {
    30
}
fn default_confirm_snapshots() -> u32 {
    2
}
fn default_position_tolerance() -> f64 {
    1e-8
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_health_interval(),
            confirm_snapshots: default_confirm_snapshots(),
            position_tolerance: default_position_tolerance(),
        }
    }
}

/// 执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// 协调器tick周期（秒）
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_true")]
    pub startup_cancel_all: bool,
    #[serde(default = "default_true")]
    pub shutdown_cancel_all: bool,
    /// 停机时是否市价平掉剩余仓位
    #[serde(default)]
    pub close_position_on_exit: bool,
    /// 停机各步骤的重试上限
    #[serde(default = "default_shutdown_retries")]
    pub shutdown_retry_limit: u32,
}

fn default_tick_interval() -> u64 {
    2
}
fn default_true() -> bool {
    true
}
fn default_shutdown_retries() -> u32 {
    3
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            startup_cancel_all: true,
            shutdown_cancel_all: true,
            close_position_on_exit: false,
            shutdown_retry_limit: default_shutdown_retries(),
        }
    }
}

/// 网格策略完整配置，加载后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub strategy: StrategySection,
    pub exchange: ExchangeSection,
    pub symbol: String,
    pub grid: GridSection,
    pub risk: RiskSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub execution: ExecutionSection,
}

impl GridConfig {
    /// 启动时一次性校验，精度不一致直接拒绝启动
    pub fn validate(&self) -> Result<(), ExchangeError> {
        let grid = &self.grid;

        if grid.interval <= 0.0 {
            return Err(ExchangeError::ConfigError(
                "grid.interval 必须为正数".to_string(),
            ));
        }
        if grid.order_amount <= 0.0 {
            return Err(ExchangeError::ConfigError(
                "grid.order_amount 必须为正数".to_string(),
            ));
        }
        if grid.price_decimals > 12 {
            return Err(ExchangeError::PrecisionError {
                field: "price_decimals".to_string(),
                reason: format!("{} 超出合理范围", grid.price_decimals),
            });
        }
        if grid.amount_precision > 12 {
            return Err(ExchangeError::PrecisionError {
                field: "amount_precision".to_string(),
                reason: format!("{} 超出合理范围", grid.amount_precision),
            });
        }

        // 价差本身必须在配置精度下可精确表示，否则梯子间距不变式无法成立
        if quantize_price(grid.interval, grid.price_decimals) != grid.interval {
            return Err(ExchangeError::PrecisionError {
                field: "interval".to_string(),
                reason: format!(
                    "{} 无法在 {} 位小数下精确表示",
                    grid.interval, grid.price_decimals
                ),
            });
        }
        if quantize_amount(grid.order_amount, grid.amount_precision) != grid.order_amount {
            return Err(ExchangeError::PrecisionError {
                field: "order_amount".to_string(),
                reason: format!(
                    "{} 无法在 {} 位精度下精确表示",
                    grid.order_amount, grid.amount_precision
                ),
            });
        }

        if grid.mode.is_follow() {
            let follow = grid.follow.as_ref().ok_or_else(|| {
                ExchangeError::ConfigError("跟随模式缺少 grid.follow 配置".to_string())
            })?;
            if follow.grid_count == 0 {
                return Err(ExchangeError::ConfigError(
                    "follow.grid_count 必须大于0".to_string(),
                ));
            }
            if follow.follow_distance <= 0.0 {
                return Err(ExchangeError::ConfigError(
                    "follow.follow_distance 必须为正数".to_string(),
                ));
            }
            if follow.recompute_timeout_secs == 0 {
                return Err(ExchangeError::ConfigError(
                    "follow.recompute_timeout_secs 必须大于0".to_string(),
                ));
            }
        } else {
            let (lower, upper) = match (grid.lower_price, grid.upper_price) {
                (Some(lower), Some(upper)) => (lower, upper),
                _ => {
                    return Err(ExchangeError::ConfigError(
                        "固定模式需要 lower_price 与 upper_price".to_string(),
                    ))
                }
            };
            if lower <= 0.0 || upper <= lower {
                return Err(ExchangeError::ConfigError(format!(
                    "价格区间不合法: [{}, {}]",
                    lower, upper
                )));
            }
            if upper - lower < grid.interval {
                return Err(ExchangeError::ConfigError(
                    "价格区间小于一个格距".to_string(),
                ));
            }
        }

        if grid.mode.is_martingale() && grid.martingale_factor < 1.0 {
            return Err(ExchangeError::ConfigError(
                "martingale_factor 必须 >= 1".to_string(),
            ));
        }
        if grid.leverage == 0 {
            return Err(ExchangeError::ConfigError("leverage 必须 >= 1".to_string()));
        }
        if !(0.0..0.1).contains(&grid.fee_rate) {
            return Err(ExchangeError::ConfigError(format!(
                "fee_rate 不合理: {}",
                grid.fee_rate
            )));
        }

        let percent_fields = [
            ("stop_loss.trigger_percent", self.risk.stop_loss.trigger_percent, self.risk.stop_loss.enabled),
            (
                "capital_protection.trigger_percent",
                self.risk.capital_protection.trigger_percent,
                self.risk.capital_protection.enabled,
            ),
            (
                "take_profit.trigger_percent",
                self.risk.take_profit.trigger_percent,
                self.risk.take_profit.enabled,
            ),
        ];
        for (name, value, enabled) in percent_fields {
            if enabled && !(0.0..1.0).contains(&value) {
                return Err(ExchangeError::ConfigError(format!(
                    "{} 必须在 (0, 1) 区间: {}",
                    name, value
                )));
            }
        }

        // 资金保护阈值必须比止损更浅，否则永远轮不到它
        if self.risk.capital_protection.enabled
            && self.risk.stop_loss.enabled
            && self.risk.capital_protection.trigger_percent >= self.risk.stop_loss.trigger_percent
        {
            return Err(ExchangeError::ConfigError(
                "capital_protection 阈值必须小于 stop_loss 阈值".to_string(),
            ));
        }

        if self.health.confirm_snapshots < 2 {
            return Err(ExchangeError::ConfigError(
                "health.confirm_snapshots 最小为2".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
pub fn sample_config() -> GridConfig {
    GridConfig {
        strategy: StrategySection {
            name: "grid".to_string(),
            log_level: "INFO".to_string(),
        },
        exchange: ExchangeSection {
            id: "binance".to_string(),
            market_type: MarketType::Futures,
            testnet: false,
            requests_per_second: 10,
        },
        symbol: "BTCUSDT".to_string(),
        grid: GridSection {
            mode: GridMode::FixedLong,
            interval: 100.0,
            order_amount: 0.01,
            lower_price: Some(9000.0),
            upper_price: Some(10000.0),
            follow: None,
            price_decimals: 2,
            amount_precision: 3,
            fee_rate: 0.0004,
            leverage: 5,
            margin_mode: MarginMode::Cross,
            martingale_factor: 1.0,
        },
        risk: RiskSection {
            stop_loss: StopLossSection {
                enabled: true,
                trigger_percent: 0.05,
                escape_timeout_secs: 30,
            },
            capital_protection: CapitalProtectionSection {
                enabled: true,
                trigger_percent: 0.03,
            },
            take_profit: TakeProfitSection {
                enabled: true,
                trigger_percent: 0.04,
            },
            price_lock: PriceLockSection {
                enabled: false,
                threshold: 11000.0,
            },
            scalping: ScalpingSection {
                enabled: false,
                smart: false,
                trigger_ratio: 0.5,
                allowed_deep_drops: 3,
            },
        },
        stream: StreamSection::default(),
        health: HealthSection::default(),
        execution: ExecutionSection::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_passes() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn test_precision_mismatch_is_fatal() {
        let mut config = sample_config();
        config.grid.interval = 0.001;
        config.grid.price_decimals = 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ExchangeError::PrecisionError { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = sample_config();
        config.grid.lower_price = Some(10000.0);
        config.grid.upper_price = Some(9000.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_follow_mode_requires_follow_section() {
        let mut config = sample_config();
        config.grid.mode = GridMode::FollowLong;
        config.grid.follow = None;
        assert!(config.validate().is_err());

        config.grid.follow = Some(FollowSection {
            grid_count: 10,
            follow_distance: 200.0,
            recompute_timeout_secs: 300,
            price_offset_grids: 2,
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_capital_protection_must_be_shallower_than_stop_loss() {
        let mut config = sample_config();
        config.risk.capital_protection.trigger_percent = 0.08;
        assert!(config.validate().is_err());
    }
}
