pub mod onboarding;
pub mod sweeper;

pub use onboarding::{OnboardingSequencer, OnboardingStep, TenantProfile};
pub use sweeper::{RetentionSweeper, SweepSummary, MIN_INTERVAL_SECONDS};
