//! Grid planning and risk limits

pub mod planner;
pub mod risk;

pub use planner::{Direction, DistanceMode, GridLevel, GridPlanner, GridSettings};
pub use risk::RiskGuard;
