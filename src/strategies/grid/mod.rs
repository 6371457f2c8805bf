pub mod application;
pub mod domain;

pub use application::GridCoordinator;
pub use domain::{GridConfig, GridStatusSnapshot};
