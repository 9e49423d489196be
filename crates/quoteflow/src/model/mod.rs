//! Entities owned by the job store.

pub mod carrier_job;
pub mod job;
pub mod quote;
pub mod recipe;

pub use carrier_job::{CarrierJob, CarrierJobStatus, CarrierOutcome};
pub use job::{aggregate_status, Job, JobError, JobStatus, QuoteType};
pub use quote::{
    CaptchaChallenge, CarrierCredentials, ClientData, PersonalInfo, QuoteResult, QuoteResultData,
};
pub use recipe::{DemotionRule, DiscoveredRecipe, Recipe, RecipeStatus, RecipeStep};
