// 策略模块
pub mod common;
pub mod grid;

pub use common::{Strategy, StrategyDeps, StrategyDepsBuilder, StrategyInstance};
pub use grid::{GridConfig, GridCoordinator};
