pub mod api;
pub mod cloud_init;
pub mod disk;
pub mod error;
pub mod intent;
pub mod lifecycle;
pub mod planner;
pub mod provision;
pub mod reader;
pub mod reconciler;

pub use api::*;
pub use error::{ReconcileError, Result};
pub use intent::*;
pub use lifecycle::{LifecycleController, PollConfig, PowerState};
pub use planner::{diff_config, plan_pass, PlanContext, PlanOutcome};
pub use reader::{read_observed, Observed};
pub use reconciler::*;
