// Shared between the CLI and the backend wire format
pub mod types;

pub use types::*;
