pub mod profile;

pub use profile::{PolicyBook, PolicyProfile};
