pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::SettldError;
pub use types::{
    normalize_email, Decision, DefaultMode, IngestKeyHash, Plan, RunToken, TenantId, TimestampMs,
    VerificationStatus,
};
