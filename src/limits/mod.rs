pub mod api;
pub mod catalog;
pub mod models;
pub mod service;

pub use catalog::{PgPlanCatalog, PlanCatalog, StaticPlanCatalog};
pub use models::{
    LimitExceeded, LimitKey, LimitOverride, LimitStatus, PlanQuota, ResetPeriod, UNBOUNDED,
};
pub use service::{LimitError, LimitEvaluator};
