pub mod deps;
pub mod strategy;

pub use deps::{StrategyDeps, StrategyDepsBuilder};
pub use strategy::{Strategy, StrategyInstance};
