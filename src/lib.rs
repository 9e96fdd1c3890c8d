pub mod bridge;
pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

pub use bridge::{Scenario, VuContext};
pub use engine::{Engine, RunPlan, RunState};
pub use error::EngineError;
pub use stats::RunReport;
pub use utils::parse_duration_str;
