pub mod hash;
pub mod otp;
pub mod secretbox;
pub mod session;

pub use hash::{otp_code_hash, otp_record_key, sha256, sha256_hex, sha256_str, webhook_idempotency_key};
pub use secretbox::{decrypt, encrypt, is_envelope, SecretKey};
pub use session::{issue as issue_session, verify as verify_session, SessionClaims};
