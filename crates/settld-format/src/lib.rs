//! settld-format
//!
//! Data-directory format versioning (spec §4.1): a single `format.json` file
//! recording the schema version a data directory was last written with.
//! Every other component MUST call [`StorageFormat::ensure`] (or fail
//! closed) before it writes anything else into the data directory.

pub mod storage_format;

pub use storage_format::{FormatCheck, StorageFormat, CURRENT_VERSION, SCHEMA_VERSION};
