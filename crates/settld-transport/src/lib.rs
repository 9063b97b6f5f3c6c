pub mod s3;
pub mod smtp;

pub use s3::{PutResult, S3Config, S3Error, S3Signer};
pub use smtp::{SmtpClient, SmtpConfig, SmtpError};
