pub mod webhook;

pub use webhook::{DeliveryMode, HttpAttempter, WebhookDispatchResult, WebhookDispatcher};
