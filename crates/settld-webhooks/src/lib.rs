pub mod payment_trigger;
pub mod retry;

pub use payment_trigger::{PaymentTriggerAttempter, PaymentTriggerEngine, PaymentTriggerPayload, PaymentTriggerState};
pub use retry::{backoff_delay_ms, job_id, AttemptOutcome, AttemptRecord, WebhookAttempter, WebhookRetryEngine, WebhookRetryJob};
