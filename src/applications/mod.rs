pub mod api;
pub mod models;
pub mod profiles;
pub mod service;
pub mod transitions;

pub use models::{
    ApplicantProfile, Casting, CastingRequirements, CastingStatus, Response, ResponseStatus,
};
pub use profiles::{InMemoryProfiles, PgProfileDirectory, ProfileDirectory};
pub use service::{
    check_eligibility, ApplicationError, ApplicationReceipt, ApplicationService, BillingPath,
    Ineligibility,
};
pub use transitions::{ResponseTransitions, TransitionError, TransitionReceipt};
