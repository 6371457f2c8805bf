pub mod config;
pub mod ladder;
pub mod position;
pub mod state;

pub use config::{GridConfig, GridMode};
pub use ladder::{plan_levels, Ladder, LevelPlan};
pub use position::{PositionCorrection, PositionSnapshot, PositionTracker};
pub use state::{
    GridLevel, GridRuntimeState, GridStatusSnapshot, LevelState, OrderRecord, RiskAction,
    RiskEventRecord, RunState,
};
