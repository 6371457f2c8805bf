pub mod core;
pub mod exchanges;
pub mod strategies;
pub mod utils;

#[cfg(test)]
pub mod testkit;

// 选择性导出，避免命名冲突
pub use self::core::{config::ApiKeys, error::ExchangeError, exchange::ExchangeClient};
pub use self::exchanges::create_exchange;
pub use self::strategies::{GridConfig, GridCoordinator, StrategyDepsBuilder};
