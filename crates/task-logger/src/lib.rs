//! Job bookkeeping in `task_logs`: a logger per running job, the daily job
//! plan, and the on-time/late view over both.

mod logger;
pub mod plan;
mod status;

pub use logger::{TaskLogger, TaskStatus};
pub use plan::{DailyPlan, PlannedTask};
pub use status::{dashboard, evaluate, DashboardView, JobState, JobStatus, GRACE_MINUTES};
