pub mod log;
pub mod reports;

pub use log::{is_dense_prefix, next_sequence, parse_sequence, DecisionLog, MAX_SEQUENCE};
pub use reports::{DecisionEvent, SettlementDecisionReport};
